//! OpenFlow 1.3 wire format.
//!
//! Only the subset of the protocol a learning, metering controller needs is modeled with
//! typed bodies: the handshake, keepalives, packet-in/out, flow and meter modifications, and
//! port/meter statistics. Every other message type is carried opaquely as
//! [`Body::Other`] so that a switch sending something unexpected never breaks the stream.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

pub mod action;
pub mod codec;
pub mod header;
pub mod message;
pub mod multipart;
pub mod oxm;

pub use action::{Action, Instruction, PortNo};
pub use codec::Codec;
pub use header::{Header, MsgType};
pub use message::*;
pub use multipart::{MeterStats, MultipartReply, MultipartRequest, PortStats, Stats};
pub use oxm::Match;

/// The only protocol version spoken by this crate (OpenFlow 1.3).
pub const OFP_VERSION: u8 = 0x04;

/// `buffer_id` value meaning the packet is not buffered on the switch.
pub const OFP_NO_BUFFER: u32 = 0xffff_ffff;

/// Wildcard group for flow deletions.
pub const OFPG_ANY: u32 = 0xffff_ffff;

/// Wildcard meter id, used to request statistics for all meters.
pub const OFPM_ALL: u32 = 0xffff_ffff;

/// Largest message the 16-bit length field of the header can describe.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

/// Errors raised while framing, decoding or encoding messages.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying connection failed.
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    /// The peer speaks another OpenFlow version.
    #[error("Unsupported OpenFlow version: {0:#04x}")]
    Version(u8),
    /// A length field is out of range, or a message outgrows the 16-bit length.
    #[error("Invalid message length: {0}")]
    Length(usize),
    /// A structure ended before its fixed part.
    #[error("Truncated {0}")]
    Truncated(&'static str),
    /// A field holds a value the protocol doesn't define.
    #[error("Malformed {0}")]
    Malformed(&'static str),
}

/// Fails with [`Error::Truncated`] if fewer than `n` bytes remain in `buf`.
#[inline]
pub(crate) fn need(buf: &impl Buf, n: usize, what: &'static str) -> Result<(), Error> {
    if buf.remaining() < n {
        return Err(Error::Truncated(what));
    }

    Ok(())
}

/// Overwrites a big-endian `u16` at `at`. Used to back-fill length fields once the
/// variable part of a structure has been written.
#[inline]
pub(crate) fn patch_u16(dst: &mut BytesMut, at: usize, value: usize) -> Result<(), Error> {
    let value = u16::try_from(value).map_err(|_| Error::Length(value))?;
    dst[at..at + 2].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Pads `dst` with zeroes so that the structure that started at `start` is 8-byte aligned.
#[inline]
pub(crate) fn pad_to_8(dst: &mut BytesMut, start: usize) {
    let len = dst.len() - start;
    dst.put_bytes(0, (8 - len % 8) % 8);
}
