//! Length-delimited framing of OpenFlow messages.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::{header::Header, Error, Message};

#[derive(Debug, Default)]
enum State {
    #[default]
    Header,
    Body(Header),
}

/// Frames OpenFlow messages on a byte stream.
#[derive(Debug, Default)]
pub struct Codec {
    /// The current state of the decoder.
    state: State,
}

impl Codec {
    /// Creates a codec waiting for a header.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for Codec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Header => {
                    let Some(header) = Header::peek(src)? else {
                        return Ok(None);
                    };

                    Header::skip(src);
                    self.state = State::Body(header);
                }
                State::Body(header) => {
                    let body_len = header.length as usize - Header::len();
                    if src.len() < body_len {
                        src.reserve(body_len - src.len());
                        return Ok(None);
                    }

                    let body = src.split_to(body_len).freeze();
                    self.state = State::Header;

                    return match Message::decode(header, body) {
                        Ok(message) => Ok(Some(message)),
                        Err(e) => {
                            tracing::debug!(
                                xid = header.xid,
                                kind = header.kind,
                                "Failed to decode body: {e}"
                            );
                            Err(e)
                        }
                    };
                }
            }
        }
    }
}

impl Encoder<Message> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use bytes::{BufMut, Bytes};
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::{
        Action, Body, FeaturesReply, FlowMod, FlowModCommand, Instruction, Match, MeterBand,
        MeterFlags, MeterMod, MeterModCommand, MsgType, PacketIn, PacketInReason, PacketOut,
        PortNo, OFPG_ANY, OFP_NO_BUFFER,
    };

    fn encode(message: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        Codec::new().encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn hello_is_a_bare_header() {
        let buf = encode(Message::new(1, Body::Hello(Bytes::new())));
        assert_eq!(&buf[..], &[4, 0, 0, 8, 0, 0, 0, 1]);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let buf = encode(Message::new(9, Body::EchoRequest(Bytes::from_static(b"ping"))));
        assert_eq!(buf.len(), 12);

        let mut codec = Codec::new();
        let mut partial = BytesMut::from(&buf[..5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.put_slice(&buf[5..10]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.put_slice(&buf[10..]);
        let message = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(message.xid(), 9);
        assert_eq!(message.body(), &Body::EchoRequest(Bytes::from_static(b"ping")));
        assert!(partial.is_empty());
    }

    #[test]
    fn meter_mod_layout() {
        let buf = encode(Message::new(
            3,
            Body::MeterMod(MeterMod {
                command: MeterModCommand::Add,
                flags: MeterFlags::KBPS | MeterFlags::BURST,
                meter_id: 5000,
                bands: vec![MeterBand::Drop { rate: 1000, burst_size: 10 }],
            }),
        ));

        // header (8) + meter mod (8) + drop band (16)
        assert_eq!(buf.len(), 32);
        assert_eq!(buf[1], MsgType::MeterMod as u8);
        assert_eq!(&buf[2..4], &32u16.to_be_bytes());
        assert_eq!(&buf[8..16], &[0, 0, 0, 5, 0, 0, 0x13, 0x88]);
        assert_eq!(&buf[16..20], &[0, 1, 0, 16]);
        assert_eq!(&buf[20..24], &1000u32.to_be_bytes());
        assert_eq!(&buf[24..28], &10u32.to_be_bytes());
    }

    #[test]
    fn features_reply_decodes_datapath_id() {
        let buf = encode(Message::new(
            2,
            Body::FeaturesReply(FeaturesReply {
                datapath_id: 0x0000_0000_0000_0001,
                n_buffers: 256,
                n_tables: 254,
                ..Default::default()
            }),
        ));
        assert_eq!(buf.len(), 32);

        let message = Codec::new().decode(&mut buf.clone()).unwrap().unwrap();
        let Body::FeaturesReply(features) = message.into_body() else { panic!("wrong body") };
        assert_eq!(features.datapath_id, 1);
        assert_eq!(features.n_tables, 254);
    }

    #[test]
    fn flow_mod_with_meter_decodes() {
        let flow_mod = FlowMod {
            cookie: 0,
            cookie_mask: 0,
            table_id: 0,
            command: FlowModCommand::Add,
            idle_timeout: 10,
            hard_timeout: 10,
            priority: 10,
            buffer_id: OFP_NO_BUFFER,
            out_port: PortNo::ANY,
            out_group: OFPG_ANY,
            flags: 0,
            fields: Match::all()
                .in_port(1)
                .eth_type(0x0800)
                .ip_proto(6)
                .ipv4_dst(Ipv4Addr::new(10, 0, 0, 2)),
            instructions: vec![
                Instruction::Meter(1),
                Instruction::ApplyActions(vec![Action::output(PortNo::NORMAL)]),
            ],
        };

        let mut buf = encode(Message::new(5, Body::FlowMod(flow_mod.clone())));
        let message = Codec::new().decode(&mut buf).unwrap().unwrap();

        let Body::FlowMod(decoded) = message.into_body() else { panic!("wrong body") };
        assert_eq!(decoded, flow_mod);
        assert_eq!(decoded.meter_id(), Some(1));
        assert_eq!(decoded.actions(), &[Action::output(PortNo::NORMAL)]);
    }

    #[test]
    fn packet_in_carries_frame() {
        let frame = Bytes::from_static(&[0xff; 60]);
        let packet_in = PacketIn {
            buffer_id: OFP_NO_BUFFER,
            total_len: 60,
            reason: PacketInReason::NoMatch,
            table_id: 0,
            cookie: 0,
            fields: Match::all().in_port(3),
            data: frame.clone(),
        };

        let mut buf = encode(Message::new(0, Body::PacketIn(packet_in.clone())));
        let message = Codec::new().decode(&mut buf).unwrap().unwrap();

        let Body::PacketIn(decoded) = message.into_body() else { panic!("wrong body") };
        assert_eq!(decoded.in_port(), Some(3));
        assert_eq!(decoded.data, frame);
        assert_eq!(decoded, packet_in);
    }

    #[test]
    fn packet_out_length_is_known_before_encoding() {
        let out = PacketOut {
            buffer_id: OFP_NO_BUFFER,
            in_port: 2,
            actions: vec![
                Action::output(PortNo::FLOOD),
                Action::Other { kind: 0xffff, data: Bytes::from_static(&[0; 12]) },
            ],
            data: Bytes::from_static(&[0xab; 42]),
        };

        let buf = encode(Message::new(1, Body::PacketOut(out.clone())));
        assert_eq!(out.encoded_len(), buf.len());
    }

    #[test]
    fn failed_encode_leaves_buffer_untouched() {
        let out = PacketOut {
            buffer_id: OFP_NO_BUFFER,
            in_port: 1,
            actions: vec![Action::output(PortNo::FLOOD)],
            data: Bytes::from(vec![0; crate::MAX_MESSAGE_LEN]),
        };

        let mut buf = BytesMut::from(&b"queued"[..]);
        let res = Codec::new().encode(Message::new(1, Body::PacketOut(out)), &mut buf);
        assert!(matches!(res, Err(Error::Length(_))));
        assert_eq!(&buf[..], b"queued");
    }

    #[test]
    fn unknown_type_is_kept_opaque() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[4, MsgType::PortStatus as u8, 0, 12, 0, 0, 0, 7]);
        buf.put_slice(b"port");

        let message = Codec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            message.into_body(),
            Body::Other { kind: MsgType::PortStatus as u8, data: Bytes::from_static(b"port") }
        );
    }

    #[tokio::test]
    async fn framed_stream_yields_back_to_back_messages() {
        let (tx, rx) = tokio::io::duplex(1024);
        let mut sink = FramedWrite::new(tx, Codec::new());
        let mut stream = FramedRead::new(rx, Codec::new());

        let out = Message::new(
            4,
            Body::PacketOut(PacketOut {
                buffer_id: OFP_NO_BUFFER,
                in_port: 1,
                actions: vec![Action::output(PortNo::FLOOD)],
                data: Bytes::from_static(&[0xab; 42]),
            }),
        );

        sink.send(Message::new(1, Body::Hello(Bytes::new()))).await.unwrap();
        sink.send(out.clone()).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap().kind(), MsgType::Hello as u8);
        assert_eq!(stream.next().await.unwrap().unwrap(), out);
    }
}
