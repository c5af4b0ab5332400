//! Typed message bodies.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    action::{encode_actions, Action, Instruction},
    header::{Header, MsgType},
    multipart::{MultipartReply, MultipartRequest},
    need, patch_u16, Error, Match, OFP_VERSION,
};

/// `OFPET_METER_MOD_FAILED`
pub const OFPET_METER_MOD_FAILED: u16 = 12;
/// `OFPMMFC_METER_EXISTS`
pub const OFPMMFC_METER_EXISTS: u16 = 1;

/// Switch description sent in reply to a features request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeaturesReply {
    /// Unique id of the datapath. The lower 48 bits are a MAC address.
    pub datapath_id: u64,
    /// Packets the switch can buffer at once.
    pub n_buffers: u32,
    /// Number of flow tables.
    pub n_tables: u8,
    /// Zero on the main connection.
    pub auxiliary_id: u8,
    /// Bitmap of `ofp_capabilities`.
    pub capabilities: u32,
}

/// Why a packet was sent to the controller (`ofp_packet_in_reason`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketInReason {
    /// No rule matched (table miss).
    NoMatch,
    /// Output to controller action.
    Action,
    /// Packet with an invalid TTL.
    InvalidTtl,
    /// Any other reason code.
    Unknown(u8),
}

impl From<u8> for PacketInReason {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::NoMatch,
            1 => Self::Action,
            2 => Self::InvalidTtl,
            other => Self::Unknown(other),
        }
    }
}

impl From<PacketInReason> for u8 {
    fn from(reason: PacketInReason) -> Self {
        match reason {
            PacketInReason::NoMatch => 0,
            PacketInReason::Action => 1,
            PacketInReason::InvalidTtl => 2,
            PacketInReason::Unknown(other) => other,
        }
    }
}

/// A packet forwarded from a switch to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    /// Buffer holding the packet on the switch, or [`OFP_NO_BUFFER`](crate::OFP_NO_BUFFER).
    pub buffer_id: u32,
    /// Full length of the frame, `data` may be shorter.
    pub total_len: u16,
    /// Why the packet was sent.
    pub reason: PacketInReason,
    /// Table that was looked up.
    pub table_id: u8,
    /// Cookie of the rule that sent the packet.
    pub cookie: u64,
    /// Pipeline fields; `in_port` is always present on OpenFlow 1.3 switches.
    pub fields: Match,
    /// The (possibly truncated) frame.
    pub data: Bytes,
}

impl PacketIn {
    /// Returns the port the packet arrived on.
    pub fn in_port(&self) -> Option<u32> {
        self.fields.in_port
    }
}

/// A packet injected by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    /// Buffered packet to send, or [`OFP_NO_BUFFER`](crate::OFP_NO_BUFFER) to send `data`.
    pub buffer_id: u32,
    /// Port the packet arrived on.
    pub in_port: u32,
    /// Actions applied to the packet.
    pub actions: Vec<Action>,
    /// Raw frame, only sent when the packet is not buffered on the switch.
    pub data: Bytes,
}

impl PacketOut {
    /// Size of the full message on the wire, header included.
    pub fn encoded_len(&self) -> usize {
        // buffer_id, in_port, actions_len, pad
        let fixed = Header::len() + 16;
        fixed + self.actions.iter().map(Action::encoded_len).sum::<usize>() + self.data.len()
    }
}

/// `ofp_flow_mod_command`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowModCommand {
    /// New rule.
    Add = 0,
    /// Modify all matching rules.
    Modify = 1,
    /// Modify the rule matching fields and priority exactly.
    ModifyStrict = 2,
    /// Delete all matching rules.
    Delete = 3,
    /// Delete the rule matching fields and priority exactly.
    DeleteStrict = 4,
}

impl TryFrom<u8> for FlowModCommand {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Add,
            1 => Self::Modify,
            2 => Self::ModifyStrict,
            3 => Self::Delete,
            4 => Self::DeleteStrict,
            _ => return Err(Error::Malformed("flow mod command")),
        })
    }
}

/// A flow table modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    /// Opaque identifier set by the controller.
    pub cookie: u64,
    /// Restricts modify and delete to rules whose cookie matches under this mask.
    pub cookie_mask: u64,
    /// Target table.
    pub table_id: u8,
    /// What to do with the rule.
    pub command: FlowModCommand,
    /// Seconds without traffic before the rule expires, 0 to disable.
    pub idle_timeout: u16,
    /// Seconds before the rule expires regardless of traffic, 0 to disable.
    pub hard_timeout: u16,
    /// Higher values match first.
    pub priority: u16,
    /// Buffered packet to run through the rule once installed.
    pub buffer_id: u32,
    /// Deletions only: restrict to rules outputting to this port.
    pub out_port: u32,
    /// Deletions only: restrict to rules outputting to this group.
    pub out_group: u32,
    /// Bitmap of `ofp_flow_mod_flags`.
    pub flags: u16,
    /// Packet fields the rule matches on.
    pub fields: Match,
    /// Applied to matching packets, in order.
    pub instructions: Vec<Instruction>,
}

impl FlowMod {
    /// Returns the meter referenced by the instruction set, if any.
    pub fn meter_id(&self) -> Option<u32> {
        self.instructions.iter().find_map(|i| match i {
            Instruction::Meter(id) => Some(*id),
            _ => None,
        })
    }

    /// Returns the actions applied by the first apply-actions instruction.
    pub fn actions(&self) -> &[Action] {
        self.instructions
            .iter()
            .find_map(|i| match i {
                Instruction::ApplyActions(actions) => Some(actions.as_slice()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

/// `ofp_meter_mod_command`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MeterModCommand {
    /// New meter.
    Add = 0,
    /// Change the bands of an existing meter.
    Modify = 1,
    /// Remove a meter.
    Delete = 2,
}

impl TryFrom<u16> for MeterModCommand {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Add,
            1 => Self::Modify,
            2 => Self::Delete,
            _ => return Err(Error::Malformed("meter mod command")),
        })
    }
}

/// Meter configuration flags (`ofp_meter_flags`).
#[derive(Debug)]
pub struct MeterFlags;

impl MeterFlags {
    /// Rates are in kbit/s.
    pub const KBPS: u16 = 1 << 0;
    /// Rates are in packets per second.
    pub const PKTPS: u16 = 1 << 1;
    /// Honour the band burst size.
    pub const BURST: u16 = 1 << 2;
    /// Collect band statistics.
    pub const STATS: u16 = 1 << 3;
}

const METER_BAND_DROP: u16 = 1;
const METER_BAND_LEN: usize = 16;

/// A rate band of a meter (`ofp_meter_band_header`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeterBand {
    /// Drop packets above `rate`.
    Drop {
        /// kbit/s, or packets per second with [`MeterFlags::PKTPS`].
        rate: u32,
        /// Only honoured with [`MeterFlags::BURST`].
        burst_size: u32,
    },
    /// Any other band type, kept as raw bytes after the common band header.
    Other {
        /// `ofp_meter_band_type`
        kind: u16,
        /// Band rate.
        rate: u32,
        /// Band burst size.
        burst_size: u32,
        /// Type specific body.
        data: Bytes,
    },
}

impl MeterBand {
    /// Returns the rate of the band.
    pub const fn rate(&self) -> u32 {
        match self {
            Self::Drop { rate, .. } | Self::Other { rate, .. } => *rate,
        }
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        match self {
            Self::Drop { rate, burst_size } => {
                dst.put_u16(METER_BAND_DROP);
                dst.put_u16(METER_BAND_LEN as u16);
                dst.put_u32(*rate);
                dst.put_u32(*burst_size);
                dst.put_bytes(0, 4);
            }
            Self::Other { kind, rate, burst_size, data } => {
                let start = dst.len();
                dst.put_u16(*kind);
                dst.put_u16(0);
                dst.put_u32(*rate);
                dst.put_u32(*burst_size);
                dst.put_slice(data);
                patch_u16(dst, start + 2, dst.len() - start)?;
            }
        }

        Ok(())
    }

    fn decode_list(mut src: Bytes) -> Result<Vec<Self>, Error> {
        let mut bands = Vec::new();

        while src.has_remaining() {
            need(&src, 12, "meter band")?;
            let kind = src.get_u16();
            let len = src.get_u16() as usize;
            if len < 12 {
                return Err(Error::Length(len));
            }
            need(&src, len - 4, "meter band body")?;
            let rate = src.get_u32();
            let burst_size = src.get_u32();
            let data = src.split_to(len - 12);

            bands.push(match kind {
                METER_BAND_DROP => Self::Drop { rate, burst_size },
                _ => Self::Other { kind, rate, burst_size, data },
            });
        }

        Ok(bands)
    }
}

/// A meter table modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterMod {
    /// What to do with the meter.
    pub command: MeterModCommand,
    /// Bitmap of [`MeterFlags`].
    pub flags: u16,
    /// Target meter.
    pub meter_id: u32,
    /// Bands of the meter, only the one with the highest exceeded rate applies.
    pub bands: Vec<MeterBand>,
}

/// An error reported by the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    /// `ofp_error_type`
    pub kind: u16,
    /// Type specific error code.
    pub code: u16,
    /// At least the first 64 bytes of the offending request.
    pub data: Bytes,
}

impl ErrorMsg {
    /// Returns `true` if the switch rejected a meter ADD because the meter already exists.
    pub fn is_meter_exists(&self) -> bool {
        self.kind == OFPET_METER_MOD_FAILED && self.code == OFPMMFC_METER_EXISTS
    }

    /// Returns the meter id of the rejected meter mod echoed back in `data`, if the payload
    /// contains one.
    pub fn failed_meter_id(&self) -> Option<u32> {
        // ofp_header (8) + command (2) + flags (2) + meter_id (4)
        let bytes = self.data.get(12..16)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// The body of an OpenFlow message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// HELLO. Elements (version bitmap) are carried raw.
    Hello(Bytes),
    /// ERROR
    Error(ErrorMsg),
    /// ECHO_REQUEST with an arbitrary payload.
    EchoRequest(Bytes),
    /// ECHO_REPLY, repeats the payload of the request.
    EchoReply(Bytes),
    /// FEATURES_REQUEST
    FeaturesRequest,
    /// FEATURES_REPLY
    FeaturesReply(FeaturesReply),
    /// PACKET_IN
    PacketIn(PacketIn),
    /// PACKET_OUT
    PacketOut(PacketOut),
    /// FLOW_MOD
    FlowMod(FlowMod),
    /// METER_MOD
    MeterMod(MeterMod),
    /// MULTIPART_REQUEST
    MultipartRequest(MultipartRequest),
    /// MULTIPART_REPLY
    MultipartReply(MultipartReply),
    /// BARRIER_REQUEST
    BarrierRequest,
    /// BARRIER_REPLY
    BarrierReply,
    /// Any message type without a typed representation.
    Other {
        /// `ofp_type`
        kind: u8,
        /// Everything after the header.
        data: Bytes,
    },
}

impl Body {
    /// Returns the `ofp_type` of the body.
    pub fn kind(&self) -> u8 {
        let kind = match self {
            Self::Hello(_) => MsgType::Hello,
            Self::Error(_) => MsgType::Error,
            Self::EchoRequest(_) => MsgType::EchoRequest,
            Self::EchoReply(_) => MsgType::EchoReply,
            Self::FeaturesRequest => MsgType::FeaturesRequest,
            Self::FeaturesReply(_) => MsgType::FeaturesReply,
            Self::PacketIn(_) => MsgType::PacketIn,
            Self::PacketOut(_) => MsgType::PacketOut,
            Self::FlowMod(_) => MsgType::FlowMod,
            Self::MeterMod(_) => MsgType::MeterMod,
            Self::MultipartRequest(_) => MsgType::MultipartRequest,
            Self::MultipartReply(_) => MsgType::MultipartReply,
            Self::BarrierRequest => MsgType::BarrierRequest,
            Self::BarrierReply => MsgType::BarrierReply,
            Self::Other { kind, .. } => return *kind,
        };

        kind as u8
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        match self {
            Self::Hello(data) | Self::EchoRequest(data) | Self::EchoReply(data) => {
                dst.put_slice(data)
            }
            Self::Other { data, .. } => dst.put_slice(data),
            Self::FeaturesRequest | Self::BarrierRequest | Self::BarrierReply => {}
            Self::Error(err) => {
                dst.put_u16(err.kind);
                dst.put_u16(err.code);
                dst.put_slice(&err.data);
            }
            Self::FeaturesReply(features) => {
                dst.put_u64(features.datapath_id);
                dst.put_u32(features.n_buffers);
                dst.put_u8(features.n_tables);
                dst.put_u8(features.auxiliary_id);
                dst.put_bytes(0, 2);
                dst.put_u32(features.capabilities);
                // reserved
                dst.put_u32(0);
            }
            Self::PacketIn(packet_in) => {
                dst.put_u32(packet_in.buffer_id);
                dst.put_u16(packet_in.total_len);
                dst.put_u8(packet_in.reason.into());
                dst.put_u8(packet_in.table_id);
                dst.put_u64(packet_in.cookie);
                packet_in.fields.encode(dst)?;
                dst.put_bytes(0, 2);
                dst.put_slice(&packet_in.data);
            }
            Self::PacketOut(packet_out) => {
                dst.put_u32(packet_out.buffer_id);
                dst.put_u32(packet_out.in_port);
                let actions_len_at = dst.len();
                dst.put_u16(0);
                dst.put_bytes(0, 6);
                let actions_start = dst.len();
                encode_actions(&packet_out.actions, dst)?;
                patch_u16(dst, actions_len_at, dst.len() - actions_start)?;
                dst.put_slice(&packet_out.data);
            }
            Self::FlowMod(flow_mod) => {
                dst.put_u64(flow_mod.cookie);
                dst.put_u64(flow_mod.cookie_mask);
                dst.put_u8(flow_mod.table_id);
                dst.put_u8(flow_mod.command as u8);
                dst.put_u16(flow_mod.idle_timeout);
                dst.put_u16(flow_mod.hard_timeout);
                dst.put_u16(flow_mod.priority);
                dst.put_u32(flow_mod.buffer_id);
                dst.put_u32(flow_mod.out_port);
                dst.put_u32(flow_mod.out_group);
                dst.put_u16(flow_mod.flags);
                dst.put_bytes(0, 2);
                flow_mod.fields.encode(dst)?;
                for instruction in &flow_mod.instructions {
                    instruction.encode(dst)?;
                }
            }
            Self::MeterMod(meter_mod) => {
                dst.put_u16(meter_mod.command as u16);
                dst.put_u16(meter_mod.flags);
                dst.put_u32(meter_mod.meter_id);
                for band in &meter_mod.bands {
                    band.encode(dst)?;
                }
            }
            Self::MultipartRequest(request) => request.encode(dst),
            Self::MultipartReply(reply) => reply.encode(dst),
        }

        Ok(())
    }

    fn decode(kind: u8, mut src: Bytes) -> Result<Self, Error> {
        let Some(msg_type) = MsgType::from_u8(kind) else {
            return Ok(Self::Other { kind, data: src });
        };

        let body = match msg_type {
            MsgType::Hello => Self::Hello(src),
            MsgType::EchoRequest => Self::EchoRequest(src),
            MsgType::EchoReply => Self::EchoReply(src),
            MsgType::FeaturesRequest => Self::FeaturesRequest,
            MsgType::BarrierRequest => Self::BarrierRequest,
            MsgType::BarrierReply => Self::BarrierReply,
            MsgType::Error => {
                need(&src, 4, "error")?;
                let kind = src.get_u16();
                let code = src.get_u16();
                Self::Error(ErrorMsg { kind, code, data: src })
            }
            MsgType::FeaturesReply => {
                need(&src, 24, "features reply")?;
                let datapath_id = src.get_u64();
                let n_buffers = src.get_u32();
                let n_tables = src.get_u8();
                let auxiliary_id = src.get_u8();
                src.advance(2);
                let capabilities = src.get_u32();
                Self::FeaturesReply(FeaturesReply {
                    datapath_id,
                    n_buffers,
                    n_tables,
                    auxiliary_id,
                    capabilities,
                })
            }
            MsgType::PacketIn => {
                need(&src, 16, "packet in")?;
                let buffer_id = src.get_u32();
                let total_len = src.get_u16();
                let reason = src.get_u8().into();
                let table_id = src.get_u8();
                let cookie = src.get_u64();
                let fields = Match::decode(&mut src)?;
                need(&src, 2, "packet in padding")?;
                src.advance(2);
                Self::PacketIn(PacketIn {
                    buffer_id,
                    total_len,
                    reason,
                    table_id,
                    cookie,
                    fields,
                    data: src,
                })
            }
            MsgType::PacketOut => {
                need(&src, 16, "packet out")?;
                let buffer_id = src.get_u32();
                let in_port = src.get_u32();
                let actions_len = src.get_u16() as usize;
                src.advance(6);
                need(&src, actions_len, "packet out actions")?;
                let actions = Action::decode_list(src.split_to(actions_len))?;
                Self::PacketOut(PacketOut { buffer_id, in_port, actions, data: src })
            }
            MsgType::FlowMod => {
                need(&src, 40, "flow mod")?;
                let cookie = src.get_u64();
                let cookie_mask = src.get_u64();
                let table_id = src.get_u8();
                let command = FlowModCommand::try_from(src.get_u8())?;
                let idle_timeout = src.get_u16();
                let hard_timeout = src.get_u16();
                let priority = src.get_u16();
                let buffer_id = src.get_u32();
                let out_port = src.get_u32();
                let out_group = src.get_u32();
                let flags = src.get_u16();
                src.advance(2);
                let fields = Match::decode(&mut src)?;
                let instructions = Instruction::decode_list(src)?;
                Self::FlowMod(FlowMod {
                    cookie,
                    cookie_mask,
                    table_id,
                    command,
                    idle_timeout,
                    hard_timeout,
                    priority,
                    buffer_id,
                    out_port,
                    out_group,
                    flags,
                    fields,
                    instructions,
                })
            }
            MsgType::MeterMod => {
                need(&src, 8, "meter mod")?;
                let command = MeterModCommand::try_from(src.get_u16())?;
                let flags = src.get_u16();
                let meter_id = src.get_u32();
                let bands = MeterBand::decode_list(src)?;
                Self::MeterMod(MeterMod { command, flags, meter_id, bands })
            }
            MsgType::MultipartRequest => Self::MultipartRequest(MultipartRequest::decode(src)?),
            MsgType::MultipartReply => Self::MultipartReply(MultipartReply::decode(src)?),
            _ => Self::Other { kind, data: src },
        };

        Ok(body)
    }
}

/// An OpenFlow message: a transaction id and a body. The header is derived on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    xid: u32,
    body: Body,
}

impl Message {
    /// Creates a message with transaction id `xid`.
    pub fn new(xid: u32, body: Body) -> Self {
        Self { xid, body }
    }

    /// Returns the transaction id.
    #[inline]
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Returns the `ofp_type` of the message.
    #[inline]
    pub fn kind(&self) -> u8 {
        self.body.kind()
    }

    /// Returns the body.
    #[inline]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Consumes the message, returning its body.
    #[inline]
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Decodes the body of a message whose header has already been read.
    pub(crate) fn decode(header: Header, body: Bytes) -> Result<Self, Error> {
        Ok(Self { xid: header.xid, body: Body::decode(header.kind, body)? })
    }

    /// Encodes the full message, header included, back-filling the length.
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        let start = dst.len();
        Header { version: OFP_VERSION, kind: self.kind(), length: 0, xid: self.xid }.write(dst);

        let res = self.body.encode(dst).and_then(|_| patch_u16(dst, start + 2, dst.len() - start));
        if let Err(e) = res {
            // Leave the buffer as it was so a failed message doesn't corrupt the stream.
            dst.truncate(start);
            return Err(e);
        }

        Ok(())
    }
}
