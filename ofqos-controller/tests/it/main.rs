mod controller;
mod qos;

/// Helper functions.
mod helpers {
    use std::{future::Future, net::SocketAddr, time::Duration};

    use bytes::{BufMut, Bytes, BytesMut};
    use futures::{SinkExt, StreamExt};
    use ofqos_controller::{Controller, ControllerOptions, QosConfig};
    use ofqos_transport::tcp::Tcp;
    use ofqos_wire::{
        Body, Codec, FeaturesReply, Match, Message, PacketIn, PacketInReason, OFP_NO_BUFFER,
    };
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    pub const TIMEOUT: Duration = Duration::from_secs(5);

    pub const H1: [u8; 6] = [0, 0, 0, 0, 0, 1];
    pub const H2: [u8; 6] = [0, 0, 0, 0, 0, 2];

    /// Starts a controller on an ephemeral local port.
    pub async fn controller(qos: QosConfig) -> Controller<Tcp, SocketAddr> {
        controller_with(ControllerOptions::default(), qos).await
    }

    pub async fn controller_with(
        options: ControllerOptions,
        qos: QosConfig,
    ) -> Controller<Tcp, SocketAddr> {
        let _ = tracing_subscriber::fmt::try_init();

        let mut controller = Controller::new(Tcp::default(), options, qos);
        controller.bind("127.0.0.1:0").await.unwrap();
        controller
    }

    /// Polls `check` until it holds or [`TIMEOUT`] expires.
    pub async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(TIMEOUT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    async fn within<F: Future>(f: F) -> F::Output {
        tokio::time::timeout(TIMEOUT, f).await.expect("timed out")
    }

    /// A switch speaking just enough OpenFlow to complete the handshake.
    pub struct FakeSwitch {
        conn: Framed<TcpStream, Codec>,
    }

    impl FakeSwitch {
        pub async fn connect(addr: SocketAddr, dpid: u64) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut switch = Self { conn: Framed::new(stream, Codec::new()) };

            assert!(matches!(switch.recv().await.body(), Body::Hello(_)));
            let request = switch.recv().await;
            assert_eq!(request.body(), &Body::FeaturesRequest);

            switch.send(Message::new(request.xid(), Body::Hello(Bytes::new()))).await;
            let features = FeaturesReply { datapath_id: dpid, n_tables: 254, ..Default::default() };
            switch.send(Message::new(request.xid(), Body::FeaturesReply(features))).await;

            switch
        }

        pub async fn send(&mut self, msg: Message) {
            within(self.conn.send(msg)).await.unwrap();
        }

        pub async fn recv(&mut self) -> Message {
            within(self.conn.next()).await.expect("connection closed").expect("decode error")
        }

        /// Receives until a message satisfies `f`, discarding the others.
        pub async fn recv_until(&mut self, f: impl Fn(&Body) -> bool) -> Message {
            loop {
                let msg = self.recv().await;
                if f(msg.body()) {
                    return msg;
                }
            }
        }

        /// Collects everything received until the controller stays quiet for `quiet`.
        pub async fn drain(&mut self, quiet: Duration) -> Vec<Body> {
            let mut out = Vec::new();
            while let Ok(Some(Ok(msg))) = tokio::time::timeout(quiet, self.conn.next()).await {
                out.push(msg.into_body());
            }
            out
        }

        pub async fn packet_in(&mut self, in_port: u32, data: Bytes) {
            let packet_in = PacketIn {
                buffer_id: OFP_NO_BUFFER,
                total_len: data.len() as u16,
                reason: PacketInReason::NoMatch,
                table_id: 0,
                cookie: 0,
                fields: Match::all().in_port(in_port),
                data,
            };
            self.send(Message::new(0, Body::PacketIn(packet_in))).await;
        }
    }

    pub fn eth_frame(src: [u8; 6], dst: [u8; 6], ethertype: u16, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&dst);
        buf.put_slice(&src);
        buf.put_u16(ethertype);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// A TCP segment from 10.0.0.1 to 10.0.0.2 carrying only its ports.
    pub fn tcp_frame(src: [u8; 6], dst: [u8; 6], src_port: u16, dst_port: u16) -> Bytes {
        let mut ip = BytesMut::new();
        ip.put_u8(0x45);
        ip.put_u8(0);
        ip.put_u16(40);
        ip.put_u32(0);
        ip.put_u8(64);
        ip.put_u8(6);
        ip.put_u16(0);
        ip.put_slice(&[10, 0, 0, 1]);
        ip.put_slice(&[10, 0, 0, 2]);
        ip.put_u16(src_port);
        ip.put_u16(dst_port);
        ip.put_bytes(0, 16);

        eth_frame(src, dst, 0x0800, &ip)
    }
}
