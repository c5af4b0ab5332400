//! Port and meter statistics, carried by multipart messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{need, Error};

const MP_PORT_STATS: u16 = 4;
const MP_METER: u16 = 9;

/// `OFPMPF_REPLY_MORE`: more replies follow for the same request.
const MPF_REPLY_MORE: u16 = 1;

const PORT_STATS_LEN: usize = 112;
const METER_STATS_HEADER_LEN: usize = 40;
const METER_BAND_STATS_LEN: usize = 16;

/// A statistics request (`ofp_multipart_request`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartRequest {
    /// Counters for one port, or every port with [`PortNo::ANY`](crate::PortNo::ANY).
    PortStats {
        /// Port to query.
        port_no: u32,
    },
    /// Counters for one meter, or every meter with [`OFPM_ALL`](crate::OFPM_ALL).
    MeterStats {
        /// Meter to query.
        meter_id: u32,
    },
    /// Any other multipart type.
    Other {
        /// `ofp_multipart_type`
        kind: u16,
        /// Request body after the multipart header.
        body: Bytes,
    },
}

impl MultipartRequest {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let (kind, id) = match self {
            Self::PortStats { port_no } => (MP_PORT_STATS, *port_no),
            Self::MeterStats { meter_id } => (MP_METER, *meter_id),
            Self::Other { kind, body } => {
                dst.put_u16(*kind);
                dst.put_u16(0);
                dst.put_bytes(0, 4);
                dst.put_slice(body);
                return;
            }
        };

        dst.put_u16(kind);
        dst.put_u16(0);
        dst.put_bytes(0, 4);
        dst.put_u32(id);
        dst.put_bytes(0, 4);
    }

    pub(crate) fn decode(mut src: Bytes) -> Result<Self, Error> {
        need(&src, 8, "multipart request")?;
        let kind = src.get_u16();
        src.advance(6);

        match kind {
            MP_PORT_STATS => {
                need(&src, 4, "port stats request")?;
                Ok(Self::PortStats { port_no: src.get_u32() })
            }
            MP_METER => {
                need(&src, 4, "meter stats request")?;
                Ok(Self::MeterStats { meter_id: src.get_u32() })
            }
            _ => Ok(Self::Other { kind, body: src }),
        }
    }
}

/// Per-port counters (`ofp_port_stats`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortStats {
    /// Port the counters belong to.
    pub port_no: u32,
    /// Packets received.
    pub rx_packets: u64,
    /// Packets transmitted.
    pub tx_packets: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Bytes transmitted.
    pub tx_bytes: u64,
    /// Received packets dropped.
    pub rx_dropped: u64,
    /// Transmitted packets dropped.
    pub tx_dropped: u64,
    /// Receive errors, a superset of the more specific ones below.
    pub rx_errors: u64,
    /// Transmit errors.
    pub tx_errors: u64,
    /// Frame alignment errors.
    pub rx_frame_err: u64,
    /// Packets with RX overrun.
    pub rx_over_err: u64,
    /// CRC errors.
    pub rx_crc_err: u64,
    /// Collisions.
    pub collisions: u64,
    /// Seconds the port has been alive.
    pub duration_sec: u32,
    /// Nanoseconds beyond `duration_sec`.
    pub duration_nsec: u32,
}

impl PortStats {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.port_no);
        dst.put_bytes(0, 4);
        for counter in [
            self.rx_packets,
            self.tx_packets,
            self.rx_bytes,
            self.tx_bytes,
            self.rx_dropped,
            self.tx_dropped,
            self.rx_errors,
            self.tx_errors,
            self.rx_frame_err,
            self.rx_over_err,
            self.rx_crc_err,
            self.collisions,
        ] {
            dst.put_u64(counter);
        }
        dst.put_u32(self.duration_sec);
        dst.put_u32(self.duration_nsec);
    }

    fn decode(src: &mut Bytes) -> Self {
        let port_no = src.get_u32();
        src.advance(4);
        Self {
            port_no,
            rx_packets: src.get_u64(),
            tx_packets: src.get_u64(),
            rx_bytes: src.get_u64(),
            tx_bytes: src.get_u64(),
            rx_dropped: src.get_u64(),
            tx_dropped: src.get_u64(),
            rx_errors: src.get_u64(),
            tx_errors: src.get_u64(),
            rx_frame_err: src.get_u64(),
            rx_over_err: src.get_u64(),
            rx_crc_err: src.get_u64(),
            collisions: src.get_u64(),
            duration_sec: src.get_u32(),
            duration_nsec: src.get_u32(),
        }
    }
}

/// Per-meter counters (`ofp_meter_stats`). Band counters are `(packets, bytes)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeterStats {
    /// Meter the counters belong to.
    pub meter_id: u32,
    /// Rules bound to the meter.
    pub flow_count: u32,
    /// Packets that entered the meter.
    pub packet_in_count: u64,
    /// Bytes that entered the meter.
    pub byte_in_count: u64,
    /// Seconds the meter has been installed.
    pub duration_sec: u32,
    /// Nanoseconds beyond `duration_sec`.
    pub duration_nsec: u32,
    /// `(packets, bytes)` processed by each band.
    pub bands: Vec<(u64, u64)>,
}

impl MeterStats {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.meter_id);
        dst.put_u16((METER_STATS_HEADER_LEN + self.bands.len() * METER_BAND_STATS_LEN) as u16);
        dst.put_bytes(0, 6);
        dst.put_u32(self.flow_count);
        dst.put_u64(self.packet_in_count);
        dst.put_u64(self.byte_in_count);
        dst.put_u32(self.duration_sec);
        dst.put_u32(self.duration_nsec);
        for (packets, bytes) in &self.bands {
            dst.put_u64(*packets);
            dst.put_u64(*bytes);
        }
    }

    fn decode(src: &mut Bytes) -> Result<Self, Error> {
        need(src, METER_STATS_HEADER_LEN, "meter stats")?;
        let meter_id = src.get_u32();
        let len = src.get_u16() as usize;
        if len < METER_STATS_HEADER_LEN {
            return Err(Error::Length(len));
        }
        need(src, len - 6, "meter band stats")?;
        src.advance(6);

        let mut stats = Self {
            meter_id,
            flow_count: src.get_u32(),
            packet_in_count: src.get_u64(),
            byte_in_count: src.get_u64(),
            duration_sec: src.get_u32(),
            duration_nsec: src.get_u32(),
            bands: Vec::new(),
        };

        let mut bands = src.split_to(len - METER_STATS_HEADER_LEN);
        while bands.remaining() >= METER_BAND_STATS_LEN {
            stats.bands.push((bands.get_u64(), bands.get_u64()));
        }

        Ok(stats)
    }
}

/// The statistics carried by a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stats {
    /// `OFPMP_PORT_STATS`
    Port(Vec<PortStats>),
    /// `OFPMP_METER`
    Meter(Vec<MeterStats>),
    /// Any other multipart type.
    Other {
        /// `ofp_multipart_type`
        kind: u16,
        /// Reply body after the multipart header.
        body: Bytes,
    },
}

/// A statistics reply (`ofp_multipart_reply`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartReply {
    /// Set when the switch will send further replies for the same request.
    pub more: bool,
    /// The counters.
    pub stats: Stats,
}

impl MultipartReply {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let kind = match &self.stats {
            Stats::Port(_) => MP_PORT_STATS,
            Stats::Meter(_) => MP_METER,
            Stats::Other { kind, .. } => *kind,
        };

        dst.put_u16(kind);
        dst.put_u16(if self.more { MPF_REPLY_MORE } else { 0 });
        dst.put_bytes(0, 4);

        match &self.stats {
            Stats::Port(ports) => ports.iter().for_each(|p| p.encode(dst)),
            Stats::Meter(meters) => meters.iter().for_each(|m| m.encode(dst)),
            Stats::Other { body, .. } => dst.put_slice(body),
        }
    }

    pub(crate) fn decode(mut src: Bytes) -> Result<Self, Error> {
        need(&src, 8, "multipart reply")?;
        let kind = src.get_u16();
        let flags = src.get_u16();
        src.advance(4);

        let stats = match kind {
            MP_PORT_STATS => {
                let mut ports = Vec::with_capacity(src.remaining() / PORT_STATS_LEN);
                while src.has_remaining() {
                    need(&src, PORT_STATS_LEN, "port stats")?;
                    ports.push(PortStats::decode(&mut src));
                }
                Stats::Port(ports)
            }
            MP_METER => {
                let mut meters = Vec::new();
                while src.has_remaining() {
                    meters.push(MeterStats::decode(&mut src)?);
                }
                Stats::Meter(meters)
            }
            _ => Stats::Other { kind, body: src },
        };

        Ok(Self { more: flags & MPF_REPLY_MORE != 0, stats })
    }
}
