use std::time::Duration;

/// The default size of each switch's egress queue.
pub const DEFAULT_QUEUE_SIZE: usize = 1024;

/// Options for the switch-facing side of the controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// The maximum number of concurrently connected switches.
    pub(crate) max_switches: Option<usize>,
    /// The number of messages that can be queued for a single switch before sends fail
    /// with [`SendError::Backpressure`](crate::SendError::Backpressure).
    pub(crate) egress_queue_size: usize,
    /// Idle timeout of rules installed by the learning switch, in seconds.
    pub(crate) flow_idle_timeout: u16,
    /// Hard timeout of rules installed by the learning switch, in seconds. 0 disables it.
    pub(crate) flow_hard_timeout: u16,
    /// Maximum number of learned addresses per switch.
    pub(crate) address_table_capacity: usize,
    /// Age after which a learned address is forgotten.
    pub(crate) address_ttl: Option<Duration>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_switches: None,
            egress_queue_size: DEFAULT_QUEUE_SIZE,
            flow_idle_timeout: 30,
            flow_hard_timeout: 0,
            address_table_capacity: 4096,
            address_ttl: None,
        }
    }
}

impl ControllerOptions {
    /// Sets the maximum number of concurrently connected switches. Connections above the
    /// limit are closed right after being accepted.
    pub fn max_switches(mut self, max_switches: usize) -> Self {
        self.max_switches = Some(max_switches);
        self
    }

    /// Sets the per-switch egress queue size.
    pub fn egress_queue_size(mut self, size: usize) -> Self {
        self.egress_queue_size = size.max(1);
        self
    }

    /// Sets the idle timeout (seconds) of learned forwarding rules.
    pub fn flow_idle_timeout(mut self, secs: u16) -> Self {
        self.flow_idle_timeout = secs;
        self
    }

    /// Sets the hard timeout (seconds) of learned forwarding rules.
    pub fn flow_hard_timeout(mut self, secs: u16) -> Self {
        self.flow_hard_timeout = secs;
        self
    }

    /// Sets the maximum number of addresses learned per switch. When full, the least
    /// recently seen address is evicted.
    pub fn address_table_capacity(mut self, capacity: usize) -> Self {
        self.address_table_capacity = capacity.max(1);
        self
    }

    /// Forget learned addresses that have not been seen for `ttl`.
    pub fn address_ttl(mut self, ttl: Duration) -> Self {
        self.address_ttl = Some(ttl);
        self
    }
}
