use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use ofqos_wire::{Action, Match, PortNo};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::{
    ActivePolicy, CapacityStatus, PolicyError, PolicyOutcome, PolicyService, PolicyUpdate,
    Protocol, QosClass, QosConfig, Selector, CLASS_COUNT, FIRST_POLICY_METER_ID,
    PORT_POLICY_PRIORITY, PORT_POLICY_TIMEOUT,
};
use crate::{DatapathId, FlowOptions, SwitchHandle, SwitchRegistry};

const ETH_TYPE_IPV4: u16 = 0x0800;

/// Maps selectors to meters, keeps the meters of every connected switch at the configured
/// rates, and checks budgets against the link capacity.
///
/// All state sits behind one mutex. Sends to switches never block, so the lock is held
/// while the meters and rules of an update are queued; this keeps concurrent updates from
/// interleaving their meter modifications.
#[derive(Debug)]
pub struct PolicyEngine {
    enabled: bool,
    total_capacity_kbps: u64,
    registry: Arc<SwitchRegistry>,
    state: Mutex<PolicyState>,
    capacity_warnings: AtomicUsize,
}

#[derive(Debug)]
struct PolicyState {
    class_bandwidth: [u32; CLASS_COUNT],
    best_effort: u32,
    policies: FxHashMap<Selector, ActivePolicy>,
    /// Meter ids allocated to port-list selectors. Kept when a policy is replaced.
    allocated: FxHashMap<Selector, u32>,
    next_meter_id: u32,
    /// The rate every meter should have.
    desired: FxHashMap<u32, u32>,
    /// The rate last programmed per switch and meter.
    installed: FxHashMap<DatapathId, FxHashMap<u32, u32>>,
}

impl PolicyEngine {
    /// Creates an engine from the static configuration. Nothing is programmed until a switch
    /// connects.
    pub fn new(config: QosConfig, registry: Arc<SwitchRegistry>) -> Self {
        let mut desired = FxHashMap::default();
        if config.enabled {
            for class in QosClass::all() {
                let rate = match class {
                    QosClass::Class(n) => config.class_bandwidth_kbps[n as usize - 1],
                    QosClass::BestEffort => config.best_effort_kbps,
                };
                desired.insert(class.meter_id(), rate);
            }
        }

        let engine = Self {
            enabled: config.enabled,
            total_capacity_kbps: config.total_capacity_kbps,
            registry,
            state: Mutex::new(PolicyState {
                class_bandwidth: config.class_bandwidth_kbps,
                best_effort: config.best_effort_kbps,
                policies: FxHashMap::default(),
                allocated: FxHashMap::default(),
                next_meter_id: FIRST_POLICY_METER_ID,
                desired,
                installed: FxHashMap::default(),
            }),
            capacity_warnings: AtomicUsize::new(0),
        };

        let capacity = engine.check_capacity();
        if capacity.is_exceeded() {
            engine.warn_capacity(capacity);
        }

        engine
    }

    /// Returns `true` if class meters are installed and learned flows are metered.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns how many capacity warnings have been raised so far.
    pub fn capacity_warnings(&self) -> usize {
        self.capacity_warnings.load(Ordering::Relaxed)
    }

    /// Validates and applies `update` on every connected switch, replacing any policy with
    /// the same selector. Exceeding the link capacity is logged, not rejected.
    ///
    /// A port belongs to at most one port-list policy per protocol and a class meter to at
    /// most one class-table policy: older policies lose whatever the update claims, and are
    /// dropped once they claim nothing.
    pub fn update_policy(&self, update: PolicyUpdate) -> Result<PolicyOutcome, PolicyError> {
        let PolicyUpdate { bandwidth_kbps, selector } = update;
        let selector = selector.normalize();
        validate(bandwidth_kbps, &selector)?;

        info!(bandwidth_kbps, ?selector, "Policy update");

        let switches = self.registry.list();
        let mut state = self.state.lock();

        let meter_ids = match &selector {
            Selector::PortList { protocol, ports } => {
                let meter_id = state.meter_for(&selector)?;
                state.desired.insert(meter_id, bandwidth_kbps);

                for switch in &switches {
                    state.sync_meter(switch, meter_id, bandwidth_kbps);
                    install_port_rules(switch, *protocol, ports, meter_id);
                }

                vec![meter_id]
            }
            Selector::ClassTable { ports } => {
                if !self.enabled {
                    return Err(PolicyError::QosDisabled);
                }

                let mut meter_ids = Vec::with_capacity(CLASS_COUNT);
                for port in ports {
                    let Some(QosClass::Class(n)) = QosClass::from_port(*port) else {
                        warn!(port, "Port outside the QoS class range, skipped");
                        continue;
                    };
                    state.class_bandwidth[n as usize - 1] = bandwidth_kbps;

                    let meter_id = QosClass::Class(n).meter_id();
                    if !meter_ids.contains(&meter_id) {
                        meter_ids.push(meter_id);
                    }
                }
                meter_ids.sort_unstable();

                for meter_id in &meter_ids {
                    state.desired.insert(*meter_id, bandwidth_kbps);
                    for switch in &switches {
                        state.sync_meter(switch, *meter_id, bandwidth_kbps);
                    }
                }

                meter_ids
            }
        };

        state.release_claims(&selector, &meter_ids);

        let replaced = state
            .policies
            .insert(
                selector.clone(),
                ActivePolicy {
                    protocol: selector.protocol(),
                    selector,
                    bandwidth_kbps,
                    meter_ids: meter_ids.clone(),
                },
            )
            .is_some();

        let capacity = state.capacity(self.enabled, self.total_capacity_kbps);
        drop(state);

        debug!(?meter_ids, replaced, switches = switches.len(), "Policy applied");

        if capacity.is_exceeded() {
            self.warn_capacity(capacity);
        }

        Ok(PolicyOutcome { meter_ids, capacity })
    }

    /// Returns the meter a flow should be metered with. Port-list policies for the flow's
    /// protocol take precedence, then TCP ports in the class range (source port first),
    /// then best effort.
    pub fn resolve_meter(&self, protocol: Protocol, src_port: u16, dst_port: u16) -> u32 {
        let state = self.state.lock();

        let explicit = state
            .policies
            .values()
            .filter(|p| matches!(p.selector, Selector::PortList { .. }))
            .filter(|p| p.protocol == protocol)
            .filter(|p| {
                let ports = p.selector.ports();
                ports.contains(&src_port) || ports.contains(&dst_port)
            })
            .filter_map(|p| p.meter_ids.first().copied())
            .min();

        if let Some(meter_id) = explicit {
            return meter_id;
        }

        drop(state);
        resolve_class(protocol, src_port, dst_port).meter_id()
    }

    /// Sums the configured budgets and compares them to the link capacity.
    pub fn check_capacity(&self) -> CapacityStatus {
        self.state.lock().capacity(self.enabled, self.total_capacity_kbps)
    }

    /// Programs the meters and port-list rules of a newly connected switch.
    pub fn on_switch_connected(&self, switch: &SwitchHandle) {
        let mut state = self.state.lock();

        let mut desired: Vec<(u32, u32)> = state.desired.iter().map(|(m, r)| (*m, *r)).collect();
        desired.sort_unstable();
        for (meter_id, rate) in desired {
            state.sync_meter(switch, meter_id, rate);
        }

        for policy in state.policies.values() {
            if let Selector::PortList { protocol, ports } = &policy.selector {
                install_port_rules(switch, *protocol, ports, policy.meter_ids[0]);
            }
        }

        debug!(dpid = %switch.dpid(), meters = state.desired.len(), "Switch provisioned");
    }

    /// Forgets what was programmed on a switch that went away.
    pub fn on_switch_disconnected(&self, dpid: DatapathId) {
        self.state.lock().installed.remove(&dpid);
    }

    /// Re-synchronizes a meter the switch refused to add because it already exists, by
    /// modifying it to the configured rate. Without a meter id every configured meter on
    /// the switch is modified.
    pub fn on_meter_exists(&self, switch: &SwitchHandle, meter_id: Option<u32>) {
        let mut state = self.state.lock();

        let meters: Vec<(u32, u32)> = match meter_id {
            Some(id) => state.desired.get(&id).map(|rate| vec![(id, *rate)]).unwrap_or_default(),
            None => state.desired.iter().map(|(m, r)| (*m, *r)).collect(),
        };

        for (meter_id, rate) in meters {
            info!(dpid = %switch.dpid(), meter_id, rate, "Meter exists on switch, modifying");
            if switch.modify_meter(meter_id, rate, None).is_ok() {
                state.installed.entry(switch.dpid()).or_default().insert(meter_id, rate);
            }
        }
    }

    /// Returns a copy of the active policies, ordered by meter id.
    pub fn snapshot(&self) -> Vec<ActivePolicy> {
        let mut policies: Vec<_> = self.state.lock().policies.values().cloned().collect();
        policies.sort_by(|a, b| a.meter_ids.cmp(&b.meter_ids));
        policies
    }

    /// Returns the configured rate of a meter.
    pub fn meter_rate(&self, meter_id: u32) -> Option<u32> {
        self.state.lock().desired.get(&meter_id).copied()
    }

    fn warn_capacity(&self, capacity: CapacityStatus) {
        self.capacity_warnings.fetch_add(1, Ordering::Relaxed);
        warn!(
            configured_kbps = capacity.configured_kbps,
            total_kbps = capacity.total_kbps,
            "Configured QoS bandwidth exceeds link capacity"
        );
    }
}

impl PolicyService for PolicyEngine {
    fn update_policy(&self, update: PolicyUpdate) -> Result<PolicyOutcome, PolicyError> {
        Self::update_policy(self, update)
    }

    fn policies(&self) -> Vec<ActivePolicy> {
        self.snapshot()
    }
}

impl PolicyState {
    /// Returns the meter of a port-list selector, allocating one the first time.
    fn meter_for(&mut self, selector: &Selector) -> Result<u32, PolicyError> {
        if let Some(id) = self.allocated.get(selector) {
            return Ok(*id);
        }

        let id = self.next_meter_id;
        if id >= QosClass::Class(1).meter_id() {
            return Err(PolicyError::MeterIdsExhausted);
        }

        self.next_meter_id += 1;
        self.allocated.insert(selector.clone(), id);
        Ok(id)
    }

    /// Takes the ports and class meters claimed by `selector` away from every other policy.
    fn release_claims(&mut self, selector: &Selector, meter_ids: &[u32]) {
        let overlapping: Vec<Selector> = self
            .policies
            .values()
            .filter(|p| p.selector != *selector)
            .filter(|p| match (&p.selector, selector) {
                (
                    Selector::PortList { protocol, ports },
                    Selector::PortList { protocol: claimed_protocol, ports: claimed },
                ) => {
                    protocol == claimed_protocol && ports.iter().any(|port| claimed.contains(port))
                }
                (Selector::ClassTable { .. }, Selector::ClassTable { .. }) => {
                    p.meter_ids.iter().any(|m| meter_ids.contains(m))
                }
                _ => false,
            })
            .map(|p| p.selector.clone())
            .collect();

        for old in overlapping {
            let Some(mut policy) = self.policies.remove(&old) else { continue };
            let meter_id = self.allocated.remove(&old);

            let emptied = match &mut policy.selector {
                Selector::PortList { ports, .. } => {
                    ports.retain(|p| !selector.ports().contains(p));
                    ports.is_empty()
                }
                Selector::ClassTable { .. } => {
                    policy.meter_ids.retain(|m| !meter_ids.contains(m));
                    policy.meter_ids.is_empty()
                }
            };

            if emptied {
                debug!(selector = ?old, "Policy superseded");
                if let Some(id) = meter_id {
                    self.desired.remove(&id);
                }
                continue;
            }

            debug!(from = ?old, to = ?policy.selector, "Policy narrowed");
            if let Some(id) = meter_id {
                self.allocated.insert(policy.selector.clone(), id);
            }
            self.policies.insert(policy.selector.clone(), policy);
        }
    }

    /// Adds the meter if the switch doesn't have it yet, modifies it if its rate diverges.
    fn sync_meter(&mut self, switch: &SwitchHandle, meter_id: u32, rate: u32) {
        let installed = self.installed.entry(switch.dpid()).or_default();

        let result = match installed.get(&meter_id) {
            None => switch.install_meter(meter_id, rate, None),
            Some(current) if *current != rate => switch.modify_meter(meter_id, rate, None),
            Some(_) => return,
        };

        if result.is_ok() {
            installed.insert(meter_id, rate);
        }
    }

    fn capacity(&self, enabled: bool, total_kbps: u64) -> CapacityStatus {
        let mut configured: u64 = 0;

        if enabled {
            configured += self.class_bandwidth.iter().map(|bw| *bw as u64).sum::<u64>();
            configured += self.best_effort as u64;
        }

        configured += self
            .policies
            .values()
            .filter(|p| matches!(p.selector, Selector::PortList { .. }))
            .map(|p| p.bandwidth_kbps as u64)
            .sum::<u64>();

        CapacityStatus { configured_kbps: configured, total_kbps }
    }
}

fn validate(bandwidth_kbps: u32, selector: &Selector) -> Result<(), PolicyError> {
    if bandwidth_kbps == 0 {
        return Err(PolicyError::ZeroBandwidth);
    }

    let ports = selector.ports();
    if ports.is_empty() {
        return Err(PolicyError::EmptySelector);
    }
    if ports.contains(&0) {
        return Err(PolicyError::ZeroPort);
    }

    Ok(())
}

/// The class arithmetic: TCP ports in the class range pick their class, source port first.
fn resolve_class(protocol: Protocol, src_port: u16, dst_port: u16) -> QosClass {
    if protocol != Protocol::Tcp {
        return QosClass::BestEffort;
    }

    QosClass::from_port(src_port)
        .or_else(|| QosClass::from_port(dst_port))
        .unwrap_or(QosClass::BestEffort)
}

/// One metered rule per port: traffic of `protocol` entering on `port` goes through the
/// switch's normal pipeline.
fn install_port_rules(switch: &SwitchHandle, protocol: Protocol, ports: &[u16], meter_id: u32) {
    for port in ports {
        let fields = Match::all()
            .in_port(*port as u32)
            .eth_type(ETH_TYPE_IPV4)
            .ip_proto(protocol.ip_proto());

        let options = FlowOptions::default()
            .idle_timeout(PORT_POLICY_TIMEOUT)
            .hard_timeout(PORT_POLICY_TIMEOUT)
            .meter(meter_id);

        // Failures are logged by the handle; the policy stays active.
        let _ = switch.install_flow(
            PORT_POLICY_PRIORITY,
            fields,
            vec![Action::output(PortNo::NORMAL)],
            options,
        );
    }
}
