use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{stream::FuturesUnordered, Future, StreamExt};
use ofqos_transport::{Address, PeerAddress, Transport};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    session::SwitchSession, ControllerError, ControllerOptions, ControllerStats, Dispatcher,
};

/// Accepts switch connections and runs one [`SwitchSession`] task per switch.
pub(crate) struct ControllerDriver<T: Transport<A>, A: Address> {
    /// The server transport used to accept incoming connections.
    pub(crate) transport: T,
    /// Options shared with the controller front-end.
    pub(crate) options: Arc<ControllerOptions>,
    /// Handed to every session.
    pub(crate) dispatcher: Dispatcher,
    /// Stats shared with the front-end and every session.
    pub(crate) stats: Arc<ControllerStats>,
    /// A set of pending incoming connections, represented by [`Transport::Accept`].
    pub(crate) conn_tasks: FuturesUnordered<T::Accept>,
    /// Running switch sessions. Dropping the driver aborts them.
    pub(crate) sessions: JoinSet<()>,
    /// The tracing span of the driver.
    pub(crate) span: tracing::Span,
}

impl<T, A> Future for ControllerDriver<T, A>
where
    T: Transport<A>,
    A: Address,
{
    type Output = Result<(), ControllerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _enter = this.span.clone().entered();

        loop {
            // Reap every finished session so it no longer counts against `max_switches`.
            match this.sessions.poll_join_next(cx) {
                Poll::Ready(Some(Ok(()))) => {
                    debug!(sessions = this.sessions.len(), "Switch session finished");
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    if e.is_panic() {
                        error!(err = ?e, "Switch session panicked");
                    }

                    continue;
                }
                Poll::Ready(None) | Poll::Pending => {}
            }

            if let Poll::Ready(Some(incoming)) = this.conn_tasks.poll_next_unpin(cx) {
                match incoming {
                    Ok(io) => {
                        if let Err(e) = this.on_incoming(io) {
                            error!(err = ?e, "Error setting up switch connection");
                        }
                    }
                    Err(e) => {
                        error!(err = ?e, "Error accepting incoming connection");
                    }
                }

                continue;
            }

            // Finally, poll the transport for new incoming connections.
            if let Poll::Ready(accept) = Pin::new(&mut this.transport).poll_accept(cx) {
                if let Some(max) = this.options.max_switches {
                    if this.sessions.len() + this.conn_tasks.len() >= max {
                        warn!(max, "Max switches reached, rejecting new connection");
                        drop(accept);
                        continue;
                    }
                }

                this.conn_tasks.push(accept);

                continue;
            }

            return Poll::Pending;
        }
    }
}

impl<T, A> ControllerDriver<T, A>
where
    T: Transport<A>,
    A: Address,
{
    fn on_incoming(&mut self, io: T::Io) -> Result<(), io::Error> {
        let addr = io.peer_addr()?;

        info!(?addr, "New switch connection");

        let session = SwitchSession::new(
            addr,
            io,
            self.options.egress_queue_size,
            self.dispatcher.clone(),
            Arc::clone(&self.stats),
        );

        self.sessions.spawn(session);
        debug!(sessions = self.sessions.len(), "Session spawned");

        Ok(())
    }
}
