//! L2 learning switch.
//!
//! Every packet-in teaches the controller which port its source address lives behind.
//! Packets to a learned destination get a rule pushed to the switch and are forwarded out
//! the learned port; packets to unknown destinations are flooded. When QoS is enabled, rules
//! for IPv4 TCP and UDP traffic are narrowed to the flow's 5-tuple and carry the meter the
//! [`PolicyEngine`] resolves for it.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ofqos_wire::{Action, Match, PacketIn, PortNo};
use parking_lot::Mutex;
use pnet::{
    packet::{
        ethernet::{EtherTypes, EthernetPacket},
        ip::IpNextHeaderProtocols,
        ipv4::Ipv4Packet,
        tcp::TcpPacket,
        udp::UdpPacket,
        Packet,
    },
    util::MacAddr,
};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::{
    policy::Protocol, ControllerOptions, DatapathId, FlowOptions, PolicyEngine, SwitchHandle,
    DEFAULT_FLOW_PRIORITY,
};

/// What the learning switch did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    /// Not learned from and not forwarded.
    Dropped(DropReason),
    /// Destination unknown, sent out every port but the ingress one.
    Flooded,
    /// Destination known: a rule was installed and the packet sent out `port`.
    Forwarded { port: u32, meter_id: Option<u32> },
}

/// Why a packet-in was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The packet-in carried no ingress port.
    MissingInPort,
    /// Shorter than an Ethernet header.
    Malformed,
    /// Link discovery frame.
    Lldp,
    /// Destination in `33:33:*` or `01:80:c2:00:00:0*`.
    ReservedMulticast,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    port: u32,
    last_seen: Instant,
}

/// Address to port mappings of one switch. Holds at most `capacity` addresses, evicting
/// the least recently seen one, and optionally forgets addresses older than `ttl`.
#[derive(Debug)]
pub struct AddressTable {
    entries: FxHashMap<MacAddr, Entry>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl AddressTable {
    /// Creates an empty table. Entries never expire when `ttl` is `None`.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self { entries: FxHashMap::default(), capacity: capacity.max(1), ttl }
    }

    /// Records that `addr` was seen on `port`. Returns the previous port if the address moved.
    pub fn learn(&mut self, addr: MacAddr, port: u32, now: Instant) -> Option<u32> {
        if !self.entries.contains_key(&addr) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }

        self.entries
            .insert(addr, Entry { port, last_seen: now })
            .map(|previous| previous.port)
            .filter(|previous| *previous != port)
    }

    /// Returns the port `addr` was last seen on, unless the entry expired.
    pub fn lookup(&mut self, addr: MacAddr, now: Instant) -> Option<u32> {
        let entry = self.entries.get(&addr)?;

        if let Some(ttl) = self.ttl {
            if now.saturating_duration_since(entry.last_seen) > ttl {
                self.entries.remove(&addr);
                return None;
            }
        }

        Some(entry.port)
    }

    /// Number of learned addresses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been learned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) {
        let oldest = self.entries.iter().min_by_key(|(_, e)| e.last_seen).map(|(addr, _)| *addr);
        if let Some(addr) = oldest {
            trace!(%addr, "Address table full, evicting");
            self.entries.remove(&addr);
        }
    }
}

/// The learning switch, shared by all switch sessions.
#[derive(Debug)]
pub struct LearningSwitch {
    tables: Mutex<FxHashMap<DatapathId, AddressTable>>,
    policy: Arc<PolicyEngine>,
    idle_timeout: u16,
    hard_timeout: u16,
    table_capacity: usize,
    ttl: Option<Duration>,
}

impl LearningSwitch {
    /// Creates a learning switch that meters flows through `policy`.
    pub fn new(options: &ControllerOptions, policy: Arc<PolicyEngine>) -> Self {
        Self {
            tables: Mutex::new(FxHashMap::default()),
            policy,
            idle_timeout: options.flow_idle_timeout,
            hard_timeout: options.flow_hard_timeout,
            table_capacity: options.address_table_capacity,
            ttl: options.address_ttl,
        }
    }

    /// Learns from and forwards one packet. At most one rule is installed and exactly one
    /// packet-out is emitted, unless the packet is dropped.
    pub fn handle_packet_in(&self, switch: &SwitchHandle, packet_in: &PacketIn) -> ForwardDecision {
        let Some(in_port) = packet_in.in_port() else {
            return ForwardDecision::Dropped(DropReason::MissingInPort);
        };
        let Some(eth) = EthernetPacket::new(&packet_in.data) else {
            return ForwardDecision::Dropped(DropReason::Malformed);
        };

        let src = eth.get_source();
        let dst = eth.get_destination();

        if eth.get_ethertype() == EtherTypes::Lldp {
            return ForwardDecision::Dropped(DropReason::Lldp);
        }
        if is_reserved_multicast(dst) {
            return ForwardDecision::Dropped(DropReason::ReservedMulticast);
        }

        let dpid = switch.dpid();
        let out_port = {
            let now = Instant::now();
            let mut tables = self.tables.lock();
            let table = tables
                .entry(dpid)
                .or_insert_with(|| AddressTable::new(self.table_capacity, self.ttl));

            if let Some(previous) = table.learn(src, in_port, now) {
                debug!(%dpid, %src, previous, port = in_port, "Host moved");
            }

            table.lookup(dst, now)
        };

        trace!(%dpid, %src, %dst, in_port, ?out_port, "Packet in");

        let decision = match out_port {
            Some(port) => {
                let (fields, meter_id) = self.rule_match(in_port, dst, &eth);
                let mut options = FlowOptions::default()
                    .idle_timeout(self.idle_timeout)
                    .hard_timeout(self.hard_timeout);
                options.meter_id = meter_id;

                let _ = switch.install_flow(
                    DEFAULT_FLOW_PRIORITY,
                    fields,
                    vec![Action::output(port)],
                    options,
                );

                ForwardDecision::Forwarded { port, meter_id }
            }
            None => ForwardDecision::Flooded,
        };

        let out = match decision {
            ForwardDecision::Forwarded { port, .. } => port,
            _ => PortNo::FLOOD,
        };
        let _ = switch.packet_out(
            packet_in.buffer_id,
            in_port,
            vec![Action::output(out)],
            packet_in.data.clone(),
        );

        decision
    }

    /// Returns the port `addr` was learned on for a switch.
    pub fn lookup(&self, dpid: DatapathId, addr: MacAddr) -> Option<u32> {
        self.tables.lock().get_mut(&dpid)?.lookup(addr, Instant::now())
    }

    /// Returns how many addresses are known for a switch.
    pub fn table_len(&self, dpid: DatapathId) -> usize {
        self.tables.lock().get(&dpid).map_or(0, AddressTable::len)
    }

    /// Forgets everything learned on a switch.
    pub fn purge(&self, dpid: DatapathId) {
        if let Some(table) = self.tables.lock().remove(&dpid) {
            debug!(%dpid, addresses = table.len(), "Address table purged");
        }
    }

    /// Match on ingress port and destination. With QoS enabled, IPv4 TCP and UDP traffic
    /// is matched on its 5-tuple instead and gets a meter.
    fn rule_match(
        &self,
        in_port: u32,
        dst: MacAddr,
        eth: &EthernetPacket<'_>,
    ) -> (Match, Option<u32>) {
        let fields = Match::all().in_port(in_port).eth_dst(dst);

        if !self.policy.is_enabled() || eth.get_ethertype() != EtherTypes::Ipv4 {
            return (fields, None);
        }

        let Some(ip) = Ipv4Packet::new(eth.payload()) else {
            return (fields, None);
        };

        let transport = match ip.get_next_level_protocol() {
            IpNextHeaderProtocols::Tcp => TcpPacket::new(ip.payload())
                .map(|tcp| (Protocol::Tcp, tcp.get_source(), tcp.get_destination())),
            IpNextHeaderProtocols::Udp => UdpPacket::new(ip.payload())
                .map(|udp| (Protocol::Udp, udp.get_source(), udp.get_destination())),
            _ => None,
        };

        let Some((protocol, src_port, dst_port)) = transport else {
            return (fields, None);
        };

        let fields = fields
            .eth_type(EtherTypes::Ipv4.0)
            .ip_proto(protocol.ip_proto())
            .ipv4_src(ip.get_source())
            .ipv4_dst(ip.get_destination());
        let fields = match protocol {
            Protocol::Tcp => fields.tcp_ports(src_port, dst_port),
            Protocol::Udp => fields.udp_ports(src_port, dst_port),
        };

        (fields, Some(self.policy.resolve_meter(protocol, src_port, dst_port)))
    }
}

/// IPv6 multicast (`33:33:*`) and IEEE 802.1D reserved (`01:80:c2:00:00:0*`) destinations.
fn is_reserved_multicast(addr: MacAddr) -> bool {
    let MacAddr(a, b, c, d, e, f) = addr;
    (a == 0x33 && b == 0x33) || ((a, b, c, d, e) == (0x01, 0x80, 0xc2, 0, 0) && f & 0xf0 == 0)
}
