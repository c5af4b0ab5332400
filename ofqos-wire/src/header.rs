//! The common message header.

use bytes::{Buf, BufMut, BytesMut};

use crate::{Error, OFP_VERSION};

/// Message types defined by OpenFlow 1.3 (`ofp_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// `OFPT_HELLO`
    Hello = 0,
    /// `OFPT_ERROR`
    Error = 1,
    /// `OFPT_ECHO_REQUEST`
    EchoRequest = 2,
    /// `OFPT_ECHO_REPLY`
    EchoReply = 3,
    /// `OFPT_EXPERIMENTER`
    Experimenter = 4,
    /// `OFPT_FEATURES_REQUEST`
    FeaturesRequest = 5,
    /// `OFPT_FEATURES_REPLY`
    FeaturesReply = 6,
    /// `OFPT_GET_CONFIG_REQUEST`
    GetConfigRequest = 7,
    /// `OFPT_GET_CONFIG_REPLY`
    GetConfigReply = 8,
    /// `OFPT_SET_CONFIG`
    SetConfig = 9,
    /// `OFPT_PACKET_IN`
    PacketIn = 10,
    /// `OFPT_FLOW_REMOVED`
    FlowRemoved = 11,
    /// `OFPT_PORT_STATUS`
    PortStatus = 12,
    /// `OFPT_PACKET_OUT`
    PacketOut = 13,
    /// `OFPT_FLOW_MOD`
    FlowMod = 14,
    /// `OFPT_GROUP_MOD`
    GroupMod = 15,
    /// `OFPT_PORT_MOD`
    PortMod = 16,
    /// `OFPT_TABLE_MOD`
    TableMod = 17,
    /// `OFPT_MULTIPART_REQUEST`
    MultipartRequest = 18,
    /// `OFPT_MULTIPART_REPLY`
    MultipartReply = 19,
    /// `OFPT_BARRIER_REQUEST`
    BarrierRequest = 20,
    /// `OFPT_BARRIER_REPLY`
    BarrierReply = 21,
    /// `OFPT_QUEUE_GET_CONFIG_REQUEST`
    QueueGetConfigRequest = 22,
    /// `OFPT_QUEUE_GET_CONFIG_REPLY`
    QueueGetConfigReply = 23,
    /// `OFPT_ROLE_REQUEST`
    RoleRequest = 24,
    /// `OFPT_ROLE_REPLY`
    RoleReply = 25,
    /// `OFPT_GET_ASYNC_REQUEST`
    GetAsyncRequest = 26,
    /// `OFPT_GET_ASYNC_REPLY`
    GetAsyncReply = 27,
    /// `OFPT_SET_ASYNC`
    SetAsync = 28,
    /// `OFPT_METER_MOD`
    MeterMod = 29,
}

impl MsgType {
    /// Returns the type with the given wire value, if it is defined.
    pub const fn from_u8(value: u8) -> Option<Self> {
        let kind = match value {
            0 => Self::Hello,
            1 => Self::Error,
            2 => Self::EchoRequest,
            3 => Self::EchoReply,
            4 => Self::Experimenter,
            5 => Self::FeaturesRequest,
            6 => Self::FeaturesReply,
            7 => Self::GetConfigRequest,
            8 => Self::GetConfigReply,
            9 => Self::SetConfig,
            10 => Self::PacketIn,
            11 => Self::FlowRemoved,
            12 => Self::PortStatus,
            13 => Self::PacketOut,
            14 => Self::FlowMod,
            15 => Self::GroupMod,
            16 => Self::PortMod,
            17 => Self::TableMod,
            18 => Self::MultipartRequest,
            19 => Self::MultipartReply,
            20 => Self::BarrierRequest,
            21 => Self::BarrierReply,
            22 => Self::QueueGetConfigRequest,
            23 => Self::QueueGetConfigReply,
            24 => Self::RoleRequest,
            25 => Self::RoleReply,
            26 => Self::GetAsyncRequest,
            27 => Self::GetAsyncReply,
            28 => Self::SetAsync,
            29 => Self::MeterMod,
            _ => return None,
        };

        Some(kind)
    }
}

/// The fixed 8-byte header (`ofp_header`) in front of every OpenFlow message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version, always [`OFP_VERSION`] on the wire.
    pub version: u8,
    /// `ofp_type`, see [`MsgType`].
    pub kind: u8,
    /// Total message length, including this header.
    pub length: u16,
    /// Transaction id. Replies carry the id of their request.
    pub xid: u32,
}

impl Header {
    /// Returns the length of the header in bytes.
    #[inline]
    pub const fn len() -> usize {
        8
    }

    /// Reads a header from the front of `src` without consuming it.
    ///
    /// Returns `Ok(None)` when fewer than 8 bytes are buffered.
    pub fn peek(src: &[u8]) -> Result<Option<Self>, Error> {
        if src.len() < Self::len() {
            return Ok(None);
        }

        let header = Self {
            version: src[0],
            kind: src[1],
            length: u16::from_be_bytes([src[2], src[3]]),
            xid: u32::from_be_bytes([src[4], src[5], src[6], src[7]]),
        };

        // Version negotiation happens through HELLO, which may advertise a newer version.
        // Everything after that has to be 1.3.
        if header.version != OFP_VERSION && header.kind != MsgType::Hello as u8 {
            return Err(Error::Version(header.version));
        }

        if (header.length as usize) < Self::len() {
            return Err(Error::Length(header.length as usize));
        }

        Ok(Some(header))
    }

    pub(crate) fn write(&self, dst: &mut BytesMut) {
        dst.put_u8(self.version);
        dst.put_u8(self.kind);
        dst.put_u16(self.length);
        dst.put_u32(self.xid);
    }

    pub(crate) fn skip(src: &mut impl Buf) {
        src.advance(Self::len());
    }
}
