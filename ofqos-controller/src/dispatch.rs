use std::sync::Arc;

use ofqos_wire::{ErrorMsg, MeterStats, PacketIn, PortStats};
use tracing::{debug, trace, warn};

use crate::{
    learning::ForwardDecision, ControllerStats, LearningSwitch, MeterStatsSampler, PolicyEngine,
    SwitchHandle, SwitchRegistry,
};

/// Something a switch session observed. Events of one switch are dispatched in the order
/// they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    /// The handshake completed.
    Connected,
    /// A packet was sent to the controller.
    PacketIn(PacketIn),
    /// The switch rejected a message.
    Error(ErrorMsg),
    /// A meter statistics reply.
    MeterStats(Vec<MeterStats>),
    /// A port statistics reply.
    PortStats(Vec<PortStats>),
    /// The connection is gone.
    Disconnected,
}

/// Routes switch events to the registry, the learning switch, the policy engine and the
/// meter statistics sampler.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<SwitchRegistry>,
    policy: Arc<PolicyEngine>,
    learning: Arc<LearningSwitch>,
    meter_stats: MeterStatsSampler,
    stats: Arc<ControllerStats>,
}

impl Dispatcher {
    /// Creates a dispatcher over the shared services.
    pub fn new(
        registry: Arc<SwitchRegistry>,
        policy: Arc<PolicyEngine>,
        learning: Arc<LearningSwitch>,
        meter_stats: MeterStatsSampler,
        stats: Arc<ControllerStats>,
    ) -> Self {
        Self { registry, policy, learning, meter_stats, stats }
    }

    /// Handles one event of `switch`.
    pub fn dispatch(&self, switch: &SwitchHandle, event: SwitchEvent) {
        let dpid = switch.dpid();

        match event {
            SwitchEvent::Connected => {
                if self.registry.register(switch.clone()).is_some() {
                    // Whatever was learned over the previous connection is stale.
                    self.forget(switch);
                } else {
                    self.stats.increment_active_switches();
                }

                let _ = switch.install_table_miss();
                self.policy.on_switch_connected(switch);
            }
            SwitchEvent::Disconnected => {
                if self.registry.unregister(switch) {
                    self.forget(switch);
                    self.stats.decrement_active_switches();
                }
            }
            SwitchEvent::PacketIn(packet_in) => {
                self.stats.increment_packet_ins();
                match self.learning.handle_packet_in(switch, &packet_in) {
                    ForwardDecision::Dropped(reason) => trace!(%dpid, ?reason, "Packet dropped"),
                    decision => trace!(%dpid, ?decision, "Packet forwarded"),
                }
            }
            SwitchEvent::Error(error) if error.is_meter_exists() => {
                self.policy.on_meter_exists(switch, error.failed_meter_id());
            }
            SwitchEvent::Error(error) => {
                warn!(%dpid, kind = error.kind, code = error.code, "Switch reported an error");
            }
            SwitchEvent::MeterStats(stats) => {
                trace!(%dpid, meters = stats.len(), "Meter stats");
                self.meter_stats.record(dpid, &stats);
            }
            SwitchEvent::PortStats(stats) => {
                for port in stats {
                    debug!(
                        %dpid,
                        port = port.port_no,
                        rx_bytes = port.rx_bytes,
                        tx_bytes = port.tx_bytes,
                        rx_dropped = port.rx_dropped,
                        tx_dropped = port.tx_dropped,
                        "Port stats"
                    );
                }
            }
        }
    }

    fn forget(&self, switch: &SwitchHandle) {
        let dpid = switch.dpid();
        self.learning.purge(dpid);
        self.policy.on_switch_disconnected(dpid);
        self.meter_stats.forget(dpid);
    }
}
