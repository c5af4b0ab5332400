//! QoS policies: which traffic gets which meter, and at what rate.
//!
//! Two kinds of selectors are supported. A [`Selector::PortList`] binds a small set of
//! transport ports to one dynamically allocated meter and pre-installs a metered rule per
//! port. A [`Selector::ClassTable`] sets the budget of the fixed QoS classes: TCP ports in
//! `5000..13000` fall into class `(port / 1000) - 4`, each class has a well-known meter id,
//! and every other flow is metered as best effort.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod engine;
pub use engine::PolicyEngine;

/// Number of numbered QoS classes.
pub const CLASS_COUNT: usize = 8;

/// TCP ports that map to a numbered class.
pub const QOS_PORT_RANGE: Range<u16> = 5000..13000;

/// Meter id of the best-effort class.
pub const BEST_EFFORT_METER_ID: u32 = 13000;

/// First meter id handed out to port-list policies. Ids are allocated upwards and never
/// reach the class meters.
pub const FIRST_POLICY_METER_ID: u32 = 1;

/// Priority of the rules pre-installed for port-list policies.
pub const PORT_POLICY_PRIORITY: u16 = 10;

/// Idle and hard timeout (seconds) of the rules pre-installed for port-list policies.
pub const PORT_POLICY_TIMEOUT: u16 = 10;

/// Default link capacity the class budgets are checked against.
pub const DEFAULT_TOTAL_CAPACITY_KBPS: u64 = 15_000;

/// Default budget of every class, best effort included.
pub const DEFAULT_CLASS_BANDWIDTH_KBPS: u32 = 1000;

/// Transport protocol a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP, IP protocol 6.
    Tcp,
    /// UDP, IP protocol 17.
    Udp,
}

impl Protocol {
    /// Returns the IP protocol number.
    pub const fn ip_proto(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }

    /// Returns the protocol with the given IP protocol number, if supported.
    pub const fn from_ip_proto(proto: u8) -> Option<Self> {
        match proto {
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }
}

/// A traffic class with a well-known meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QosClass {
    /// Numbered class, 1 through 8.
    Class(u8),
    /// Traffic that matches no numbered class.
    BestEffort,
}

impl QosClass {
    /// Returns the class a port maps to, if it is in [`QOS_PORT_RANGE`].
    pub fn from_port(port: u16) -> Option<Self> {
        QOS_PORT_RANGE.contains(&port).then(|| Self::Class((port / 1000 - 4) as u8))
    }

    /// `QOS1..QOS8` are 5000..12000, best effort is 13000.
    pub const fn meter_id(self) -> u32 {
        match self {
            Self::Class(n) => 4000 + n as u32 * 1000,
            Self::BestEffort => BEST_EFFORT_METER_ID,
        }
    }

    /// All classes, numbered classes first.
    pub fn all() -> impl Iterator<Item = Self> {
        (1..=CLASS_COUNT as u8).map(Self::Class).chain(std::iter::once(Self::BestEffort))
    }
}

/// Static QoS configuration, applied when the engine is built. Class budgets can be changed
/// at runtime through [`PolicyEngine::update_policy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosConfig {
    /// Install the class meters and meter learned flows.
    pub enabled: bool,
    /// Budget of classes 1 through 8.
    pub class_bandwidth_kbps: [u32; CLASS_COUNT],
    /// Budget of the best-effort class.
    pub best_effort_kbps: u32,
    /// Link capacity the budgets are checked against.
    pub total_capacity_kbps: u64,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            class_bandwidth_kbps: [DEFAULT_CLASS_BANDWIDTH_KBPS; CLASS_COUNT],
            best_effort_kbps: DEFAULT_CLASS_BANDWIDTH_KBPS,
            total_capacity_kbps: DEFAULT_TOTAL_CAPACITY_KBPS,
        }
    }
}

/// What a policy applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selector {
    /// A few ports sharing one meter.
    PortList {
        /// Protocol of the ports.
        protocol: Protocol,
        /// Sorted, distinct destination ports.
        ports: Vec<u16>,
    },
    /// Eight TCP ports, each setting the budget of the class it falls into.
    ClassTable {
        /// Sorted TCP destination ports.
        ports: [u16; CLASS_COUNT],
    },
}

impl Selector {
    /// Builds a port-list selector. Ports are sorted and deduplicated so that the same set
    /// always designates the same policy.
    pub fn port_list(protocol: Protocol, ports: impl IntoIterator<Item = u16>) -> Self {
        let mut ports: Vec<u16> = ports.into_iter().collect();
        ports.sort_unstable();
        ports.dedup();
        Self::PortList { protocol, ports }
    }

    /// Builds a class-table selector. Ports are sorted so that their order doesn't matter.
    pub fn class_table(mut ports: [u16; CLASS_COUNT]) -> Self {
        ports.sort_unstable();
        Self::ClassTable { ports }
    }

    /// Puts the ports in the order the constructors use, so equal sets compare equal.
    pub fn normalize(self) -> Self {
        match self {
            Self::PortList { protocol, ports } => Self::port_list(protocol, ports),
            Self::ClassTable { ports } => Self::class_table(ports),
        }
    }

    /// Returns the protocol. Class tables are always TCP.
    pub const fn protocol(&self) -> Protocol {
        match self {
            Self::PortList { protocol, .. } => *protocol,
            Self::ClassTable { .. } => Protocol::Tcp,
        }
    }

    /// Returns the ports, in sorted order.
    pub fn ports(&self) -> &[u16] {
        match self {
            Self::PortList { ports, .. } => ports,
            Self::ClassTable { ports } => ports,
        }
    }
}

/// A request to create or replace a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyUpdate {
    /// Requested budget.
    pub bandwidth_kbps: u32,
    /// Traffic the budget applies to.
    pub selector: Selector,
}

impl PolicyUpdate {
    /// Creates an update of `selector` to `bandwidth_kbps`.
    pub const fn new(bandwidth_kbps: u32, selector: Selector) -> Self {
        Self { bandwidth_kbps, selector }
    }
}

/// A policy currently in force.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivePolicy {
    /// Traffic the budget applies to.
    pub selector: Selector,
    /// Protocol of the selector.
    pub protocol: Protocol,
    /// Budget in force.
    pub bandwidth_kbps: u32,
    /// The meters enforcing the budget: one for a port list, one per distinct class for a
    /// class table.
    pub meter_ids: Vec<u32>,
}

/// Configured budgets against the link capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacityStatus {
    /// Sum of the budgets of the class meters and port-list policies.
    pub configured_kbps: u64,
    /// Link capacity.
    pub total_kbps: u64,
}

impl CapacityStatus {
    /// Returns `true` if the budgets add up to more than the link capacity.
    pub const fn is_exceeded(&self) -> bool {
        self.configured_kbps > self.total_kbps
    }
}

/// Result of an accepted update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutcome {
    /// Meters programmed for the policy.
    pub meter_ids: Vec<u32>,
    /// Capacity after the update. Exceeding it is reported, never rejected.
    pub capacity: CapacityStatus,
}

/// Why a policy update was rejected. A rejected update changes nothing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// The budget is zero.
    #[error("Bandwidth must be positive")]
    ZeroBandwidth,
    /// A port list without ports.
    #[error("Selector has no ports")]
    EmptySelector,
    /// A selector names port 0.
    #[error("Port 0 is not a valid transport port")]
    ZeroPort,
    /// A class table was given while QoS is off.
    #[error("QoS classes are disabled")]
    QosDisabled,
    /// Every port-list meter id is in use.
    #[error("No meter ids left for port-list policies")]
    MeterIdsExhausted,
}

/// The operations the control API needs from the policy engine.
pub trait PolicyService: Send + Sync + 'static {
    /// Validates and applies `update`, replacing any policy with the same selector.
    fn update_policy(&self, update: PolicyUpdate) -> Result<PolicyOutcome, PolicyError>;

    /// Returns the active policies.
    fn policies(&self) -> Vec<ActivePolicy>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_meter_ids() {
        assert_eq!(QosClass::Class(1).meter_id(), 5000);
        assert_eq!(QosClass::Class(8).meter_id(), 12000);
        assert_eq!(QosClass::BestEffort.meter_id(), 13000);
        assert_eq!(QosClass::all().count(), CLASS_COUNT + 1);
    }

    #[test]
    fn port_to_class() {
        assert_eq!(QosClass::from_port(5000), Some(QosClass::Class(1)));
        assert_eq!(QosClass::from_port(6000), Some(QosClass::Class(2)));
        assert_eq!(QosClass::from_port(12999), Some(QosClass::Class(8)));
        assert_eq!(QosClass::from_port(13000), None);
        assert_eq!(QosClass::from_port(4999), None);
    }

    #[test]
    fn port_list_selector_is_normalized() {
        assert_eq!(
            Selector::port_list(Protocol::Udp, [6000, 5000, 6000]),
            Selector::port_list(Protocol::Udp, [5000, 6000])
        );
    }

    #[test]
    fn selector_json_shape() {
        let json = serde_json::to_value(Selector::port_list(Protocol::Udp, [5000])).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "port_list", "protocol": "udp", "ports": [5000]})
        );
    }
}
