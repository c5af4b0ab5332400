use std::{
    collections::VecDeque,
    fmt::Debug,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{Future, SinkExt, StreamExt};
use ofqos_wire::{Body, Codec, Message, Stats};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use crate::{ControllerStats, DatapathId, Dispatcher, SwitchEvent, SwitchHandle};

/// The connection to a single switch.
///
/// The session writes HELLO and FEATURES_REQUEST as soon as it starts, and registers the
/// switch once the features reply names its datapath id. From then on it writes whatever
/// is queued through the switch's [`SwitchHandle`] and dispatches incoming messages, in
/// order, to the [`Dispatcher`]. The session resolves when the connection closes or a
/// malformed message is received; dropping it reports the switch as disconnected. A message
/// that cannot be encoded is dropped on its own.
pub(crate) struct SwitchSession<Io, A> {
    /// Remote address of the switch.
    peer: A,
    /// The framed connection.
    conn: Framed<Io, Codec>,
    /// Messages generated by the session itself, written before anything queued through
    /// the handle.
    egress_queue: VecDeque<Message>,
    /// Messages queued through the switch handle.
    from_handles: mpsc::Receiver<Message>,
    /// Sender half of `from_handles`, moved into the handle once the handshake completes.
    to_session: Option<mpsc::Sender<Message>>,
    /// Set once the switch sent its features reply.
    handle: Option<SwitchHandle>,
    dispatcher: Dispatcher,
    stats: Arc<ControllerStats>,
    should_flush: bool,
}

impl<Io, A> SwitchSession<Io, A>
where
    Io: AsyncRead + AsyncWrite + Unpin,
    A: Debug,
{
    pub(crate) fn new(
        peer: A,
        io: Io,
        queue_size: usize,
        dispatcher: Dispatcher,
        stats: Arc<ControllerStats>,
    ) -> Self {
        let (to_session, from_handles) = mpsc::channel(queue_size);

        let mut egress_queue = VecDeque::with_capacity(16);
        egress_queue.push_back(Message::new(0, Body::Hello(Default::default())));
        egress_queue.push_back(Message::new(1, Body::FeaturesRequest));

        Self {
            peer,
            conn: Framed::new(io, Codec::new()),
            egress_queue,
            from_handles,
            to_session: Some(to_session),
            handle: None,
            dispatcher,
            stats,
            should_flush: false,
        }
    }

    /// Handles a message from the switch.
    fn on_incoming(&mut self, msg: Message) {
        let xid = msg.xid();

        match msg.into_body() {
            Body::Hello(_) => debug!(peer = ?self.peer, "Hello received"),
            Body::EchoRequest(data) => {
                trace!(peer = ?self.peer, xid, "Echo request");
                self.egress_queue.push_back(Message::new(xid, Body::EchoReply(data)));
            }
            Body::EchoReply(_) => trace!(peer = ?self.peer, xid, "Echo reply"),
            Body::FeaturesReply(features) => {
                let dpid = DatapathId(features.datapath_id);
                let Some(to_session) = self.to_session.take() else {
                    debug!(peer = ?self.peer, %dpid, "Duplicate features reply ignored");
                    return;
                };

                info!(
                    peer = ?self.peer,
                    %dpid,
                    n_tables = features.n_tables,
                    n_buffers = features.n_buffers,
                    "Switch connected"
                );

                let handle = SwitchHandle::new(dpid, to_session, Arc::clone(&self.stats));
                self.dispatcher.dispatch(&handle, SwitchEvent::Connected);
                self.handle = Some(handle);
            }
            body => {
                let Some(handle) = &self.handle else {
                    debug!(
                        peer = ?self.peer,
                        kind = body.kind(),
                        "Message before handshake ignored"
                    );
                    return;
                };

                let event = match body {
                    Body::PacketIn(packet_in) => SwitchEvent::PacketIn(packet_in),
                    Body::Error(error) => SwitchEvent::Error(error),
                    Body::MultipartReply(reply) => match reply.stats {
                        Stats::Meter(meters) => SwitchEvent::MeterStats(meters),
                        Stats::Port(ports) => SwitchEvent::PortStats(ports),
                        Stats::Other { kind, .. } => {
                            debug!(dpid = %handle.dpid(), kind, "Unhandled multipart reply");
                            return;
                        }
                    },
                    Body::BarrierReply => {
                        trace!(dpid = %handle.dpid(), xid, "Barrier reply");
                        return;
                    }
                    other => {
                        debug!(dpid = %handle.dpid(), kind = other.kind(), "Unhandled message");
                        return;
                    }
                };

                self.dispatcher.dispatch(handle, event);
            }
        }
    }
}

impl<Io, A> Future for SwitchSession<Io, A>
where
    Io: AsyncRead + AsyncWrite + Unpin,
    A: Debug + Unpin,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            if this.should_flush {
                match this.conn.poll_flush_unpin(cx) {
                    Poll::Ready(Ok(())) => this.should_flush = false,
                    Poll::Ready(Err(e)) => {
                        error!(peer = ?this.peer, err = ?e, "Failed to flush connection");
                        return Poll::Ready(());
                    }
                    Poll::Pending => {}
                }
            }

            // Session-generated messages go first, then whatever the handle queued.
            if this.conn.poll_ready_unpin(cx).is_ready() {
                let next = match this.egress_queue.pop_front() {
                    Some(msg) => Some(msg),
                    None => match this.from_handles.poll_recv(cx) {
                        Poll::Ready(msg) => msg,
                        Poll::Pending => None,
                    },
                };

                if let Some(msg) = next {
                    trace!(peer = ?this.peer, kind = msg.kind(), xid = msg.xid(), "Sending");
                    match this.conn.start_send_unpin(msg) {
                        Ok(()) => {
                            this.stats.increment_tx();
                            this.should_flush = true;
                            continue;
                        }
                        Err(e) => {
                            // The codec rolls back a failed encode, only this message is lost.
                            this.stats.increment_failed_sends();
                            warn!(peer = ?this.peer, err = ?e, "Failed to encode message, dropped");
                            continue;
                        }
                    }
                }
            }

            match this.conn.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(msg))) => {
                    this.stats.increment_rx();
                    this.on_incoming(msg);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    this.stats.increment_decode_errors();
                    warn!(peer = ?this.peer, err = ?e, "Malformed message, closing session");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => {
                    info!(peer = ?this.peer, "Connection closed by switch");
                    return Poll::Ready(());
                }
                Poll::Pending => {}
            }

            return Poll::Pending;
        }
    }
}

impl<Io, A> Drop for SwitchSession<Io, A> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.dispatcher.dispatch(&handle, SwitchEvent::Disconnected);
        }
    }
}
