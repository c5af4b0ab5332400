//! OXM flow matches.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pnet::util::MacAddr;

use crate::{need, pad_to_8, patch_u16, Error};

/// `OFPMT_OXM`, the only match type defined by OpenFlow 1.3.
const MATCH_TYPE_OXM: u16 = 1;

/// `OFPXMC_OPENFLOW_BASIC`
const OXM_CLASS_BASIC: u16 = 0x8000;

// `oxm_ofb_match_fields` that this controller matches on.
const OFB_IN_PORT: u8 = 0;
const OFB_ETH_DST: u8 = 3;
const OFB_ETH_SRC: u8 = 4;
const OFB_ETH_TYPE: u8 = 5;
const OFB_IP_PROTO: u8 = 10;
const OFB_IPV4_SRC: u8 = 11;
const OFB_IPV4_DST: u8 = 12;
const OFB_TCP_SRC: u8 = 13;
const OFB_TCP_DST: u8 = 14;
const OFB_UDP_SRC: u8 = 15;
const OFB_UDP_DST: u8 = 16;

/// A flow match (`ofp_match`) built from OXM TLVs.
///
/// Fields left as `None` are wildcarded. Masked OXM entries received from a switch are
/// skipped, since the controller never installs them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Match {
    /// Ingress port.
    pub in_port: Option<u32>,
    /// Ethernet destination address.
    pub eth_dst: Option<MacAddr>,
    /// Ethernet source address.
    pub eth_src: Option<MacAddr>,
    /// Ethertype.
    pub eth_type: Option<u16>,
    /// IP protocol number. Requires `eth_type`.
    pub ip_proto: Option<u8>,
    /// IPv4 source address.
    pub ipv4_src: Option<Ipv4Addr>,
    /// IPv4 destination address.
    pub ipv4_dst: Option<Ipv4Addr>,
    /// TCP source port.
    pub tcp_src: Option<u16>,
    /// TCP destination port.
    pub tcp_dst: Option<u16>,
    /// UDP source port.
    pub udp_src: Option<u16>,
    /// UDP destination port.
    pub udp_dst: Option<u16>,
}

impl Match {
    /// Returns a match with every field wildcarded.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches the ingress port.
    pub fn in_port(mut self, port: u32) -> Self {
        self.in_port = Some(port);
        self
    }

    /// Matches the Ethernet destination.
    pub fn eth_dst(mut self, addr: MacAddr) -> Self {
        self.eth_dst = Some(addr);
        self
    }

    /// Matches the Ethernet source.
    pub fn eth_src(mut self, addr: MacAddr) -> Self {
        self.eth_src = Some(addr);
        self
    }

    /// Matches the ethertype.
    pub fn eth_type(mut self, eth_type: u16) -> Self {
        self.eth_type = Some(eth_type);
        self
    }

    /// Matches the IP protocol.
    pub fn ip_proto(mut self, proto: u8) -> Self {
        self.ip_proto = Some(proto);
        self
    }

    /// Matches the IPv4 source.
    pub fn ipv4_src(mut self, addr: Ipv4Addr) -> Self {
        self.ipv4_src = Some(addr);
        self
    }

    /// Matches the IPv4 destination.
    pub fn ipv4_dst(mut self, addr: Ipv4Addr) -> Self {
        self.ipv4_dst = Some(addr);
        self
    }

    /// Matches both TCP ports.
    pub fn tcp_ports(mut self, src: u16, dst: u16) -> Self {
        self.tcp_src = Some(src);
        self.tcp_dst = Some(dst);
        self
    }

    /// Matches both UDP ports.
    pub fn udp_ports(mut self, src: u16, dst: u16) -> Self {
        self.udp_src = Some(src);
        self.udp_dst = Some(dst);
        self
    }

    /// Returns `true` if no field is set.
    pub fn is_wildcard(&self) -> bool {
        *self == Self::default()
    }

    /// Writes the match, including trailing padding to an 8-byte boundary.
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        let start = dst.len();
        dst.put_u16(MATCH_TYPE_OXM);
        // Length placeholder, excludes padding.
        dst.put_u16(0);

        if let Some(port) = self.in_port {
            put_oxm_header(dst, OFB_IN_PORT, 4);
            dst.put_u32(port);
        }
        if let Some(addr) = self.eth_dst {
            put_oxm_header(dst, OFB_ETH_DST, 6);
            put_mac(dst, addr);
        }
        if let Some(addr) = self.eth_src {
            put_oxm_header(dst, OFB_ETH_SRC, 6);
            put_mac(dst, addr);
        }
        if let Some(eth_type) = self.eth_type {
            put_oxm_header(dst, OFB_ETH_TYPE, 2);
            dst.put_u16(eth_type);
        }
        if let Some(proto) = self.ip_proto {
            put_oxm_header(dst, OFB_IP_PROTO, 1);
            dst.put_u8(proto);
        }
        if let Some(addr) = self.ipv4_src {
            put_oxm_header(dst, OFB_IPV4_SRC, 4);
            dst.put_slice(&addr.octets());
        }
        if let Some(addr) = self.ipv4_dst {
            put_oxm_header(dst, OFB_IPV4_DST, 4);
            dst.put_slice(&addr.octets());
        }

        for (field, value) in [
            (OFB_TCP_SRC, self.tcp_src),
            (OFB_TCP_DST, self.tcp_dst),
            (OFB_UDP_SRC, self.udp_src),
            (OFB_UDP_DST, self.udp_dst),
        ] {
            if let Some(port) = value {
                put_oxm_header(dst, field, 2);
                dst.put_u16(port);
            }
        }

        patch_u16(dst, start + 2, dst.len() - start)?;
        pad_to_8(dst, start);

        Ok(())
    }

    /// Reads a match, consuming its trailing padding.
    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        need(src, 4, "match header")?;
        let kind = src.get_u16();
        let length = src.get_u16() as usize;

        if kind != MATCH_TYPE_OXM {
            return Err(Error::Malformed("match type"));
        }
        if length < 4 {
            return Err(Error::Length(length));
        }

        let padded = length + (8 - length % 8) % 8;
        need(src, padded - 4, "match fields")?;

        let mut fields = src.split_to(length - 4);
        src.advance(padded - length);

        let mut m = Self::default();
        while fields.has_remaining() {
            need(&fields, 4, "oxm header")?;
            let class = fields.get_u16();
            let field_and_mask = fields.get_u8();
            let len = fields.get_u8() as usize;
            need(&fields, len, "oxm value")?;
            let mut value = fields.split_to(len);

            let field = field_and_mask >> 1;
            let has_mask = field_and_mask & 1 == 1;
            if class != OXM_CLASS_BASIC || has_mask {
                continue;
            }

            match (field, len) {
                (OFB_IN_PORT, 4) => m.in_port = Some(value.get_u32()),
                (OFB_ETH_DST, 6) => m.eth_dst = Some(get_mac(&mut value)),
                (OFB_ETH_SRC, 6) => m.eth_src = Some(get_mac(&mut value)),
                (OFB_ETH_TYPE, 2) => m.eth_type = Some(value.get_u16()),
                (OFB_IP_PROTO, 1) => m.ip_proto = Some(value.get_u8()),
                (OFB_IPV4_SRC, 4) => m.ipv4_src = Some(Ipv4Addr::from(value.get_u32())),
                (OFB_IPV4_DST, 4) => m.ipv4_dst = Some(Ipv4Addr::from(value.get_u32())),
                (OFB_TCP_SRC, 2) => m.tcp_src = Some(value.get_u16()),
                (OFB_TCP_DST, 2) => m.tcp_dst = Some(value.get_u16()),
                (OFB_UDP_SRC, 2) => m.udp_src = Some(value.get_u16()),
                (OFB_UDP_DST, 2) => m.udp_dst = Some(value.get_u16()),
                // Fields we don't model (VLAN, IPv6, ...).
                _ => {}
            }
        }

        Ok(m)
    }
}

#[inline]
fn put_oxm_header(dst: &mut BytesMut, field: u8, len: u8) {
    dst.put_u16(OXM_CLASS_BASIC);
    dst.put_u8(field << 1);
    dst.put_u8(len);
}

#[inline]
fn put_mac(dst: &mut BytesMut, addr: MacAddr) {
    dst.put_slice(&[addr.0, addr.1, addr.2, addr.3, addr.4, addr.5]);
}

#[inline]
fn get_mac(src: &mut Bytes) -> MacAddr {
    let mut b = [0u8; 6];
    src.copy_to_slice(&mut b);
    MacAddr::new(b[0], b[1], b[2], b[3], b[4], b[5])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_match_is_padded_to_eight_bytes() {
        let mut buf = BytesMut::new();
        Match::all().encode(&mut buf).unwrap();

        // type=OXM, length=4, 4 bytes of padding
        assert_eq!(&buf[..], &[0, 1, 0, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn in_port_and_eth_dst_layout() {
        let dst = MacAddr::new(0, 0, 0, 0, 0, 2);
        let mut buf = BytesMut::new();
        Match::all().in_port(1).eth_dst(dst).encode(&mut buf).unwrap();

        // 4 header + (4 + 4) in_port + (4 + 6) eth_dst = 22, padded to 24.
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[2..4], &22u16.to_be_bytes());
        assert_eq!(&buf[4..8], &[0x80, 0x00, 0x00, 0x04]);
        assert_eq!(&buf[8..12], &1u32.to_be_bytes());
        assert_eq!(&buf[12..16], &[0x80, 0x00, 0x06, 0x06]);
        assert_eq!(&buf[16..22], &[0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn decode_skips_masked_and_unknown_fields() {
        let mut buf = BytesMut::new();
        buf.put_u16(MATCH_TYPE_OXM);
        buf.put_u16(4 + 8 + 12 + 6);
        // in_port = 7
        buf.put_slice(&[0x80, 0x00, 0x00, 0x04]);
        buf.put_u32(7);
        // masked ipv4_src: value + mask
        buf.put_slice(&[0x80, 0x00, (OFB_IPV4_SRC << 1) | 1, 0x08]);
        buf.put_u32(0x0a00_0001);
        buf.put_u32(0xffff_ff00);
        // vlan_vid (field 6), not modeled
        buf.put_slice(&[0x80, 0x00, 6 << 1, 0x02]);
        buf.put_u16(0x1001);
        buf.put_bytes(0, 2);
        buf.put_slice(b"rest");

        let mut src = buf.freeze();
        let m = Match::decode(&mut src).unwrap();

        assert_eq!(m, Match::all().in_port(7));
        assert_eq!(&src[..], b"rest");
    }

    #[test]
    fn five_tuple_survives_decode() {
        let m = Match::all()
            .eth_type(0x0800)
            .ip_proto(6)
            .ipv4_src(Ipv4Addr::new(10, 0, 0, 1))
            .ipv4_dst(Ipv4Addr::new(10, 0, 0, 2))
            .tcp_ports(6001, 80);

        let mut buf = BytesMut::new();
        m.encode(&mut buf).unwrap();
        assert_eq!(buf.len() % 8, 0);

        let decoded = Match::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, m);
    }
}
