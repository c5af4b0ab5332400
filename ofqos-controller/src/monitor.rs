//! Periodic comparison of observed usage against policy budgets.

use std::{sync::Arc, time::Duration};

use ofqos_common::bytes_to_kbps;
use ofqos_wire::MeterStats;
use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    policy::{ActivePolicy, Selector},
    DatapathId, PolicyEngine, SwitchRegistry,
};

/// Default time between two sampling passes.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_SIZE: usize = 256;

/// A source of observed usage.
pub trait UsageSampler: Send + Sync + 'static {
    /// Called once at the start of every sampling pass.
    fn on_tick(&self) {}

    /// Returns the current rate of the traffic covered by `policy`, in kbit/s. `None` if
    /// nothing has been observed yet.
    fn sample(&self, policy: &ActivePolicy) -> Option<u64>;
}

/// Outcome of sampling one policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageEvent {
    /// Usage is above the budget.
    Exceeded {
        /// The sampled policy.
        selector: Selector,
        /// Configured budget.
        budget_kbps: u32,
        /// Observed rate.
        usage_kbps: u64,
        /// `usage_kbps` minus `budget_kbps`.
        overage_kbps: u64,
    },
    /// Usage is at or below the budget.
    WithinBudget {
        /// The sampled policy.
        selector: Selector,
        /// Configured budget.
        budget_kbps: u32,
        /// Observed rate.
        usage_kbps: u64,
    },
}

impl UsageEvent {
    /// Returns `true` for [`UsageEvent::Exceeded`].
    pub const fn is_exceeded(&self) -> bool {
        matches!(self, Self::Exceeded { .. })
    }
}

/// Samples every active policy at a fixed interval and publishes a [`UsageEvent`] for each.
///
/// The policy set is copied at the start of each pass; the engine's lock is not held while
/// sampling.
#[derive(Debug)]
pub struct UsageMonitor<S> {
    policy: Arc<PolicyEngine>,
    sampler: S,
    interval: Duration,
    events: broadcast::Sender<UsageEvent>,
}

impl<S: UsageSampler> UsageMonitor<S> {
    /// Creates a monitor sampling the policies of `policy` with `sampler`.
    pub fn new(policy: Arc<PolicyEngine>, sampler: S) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self { policy, sampler, interval: DEFAULT_MONITOR_INTERVAL, events }
    }

    /// Sets the sampling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Subscribes to the events of every following pass.
    pub fn subscribe(&self) -> broadcast::Receiver<UsageEvent> {
        self.events.subscribe()
    }

    /// Same as [`Self::subscribe`], as a stream.
    pub fn events(&self) -> BroadcastStream<UsageEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Runs a single sampling pass and returns its events.
    pub fn run_once(&self) -> Vec<UsageEvent> {
        let policies = self.policy.snapshot();
        self.sampler.on_tick();

        let mut events = Vec::with_capacity(policies.len());
        for policy in policies {
            let Some(usage_kbps) = self.sampler.sample(&policy) else {
                debug!(selector = ?policy.selector, "No usage sample yet");
                continue;
            };

            let budget = policy.bandwidth_kbps as u64;
            let event = if usage_kbps > budget {
                let overage_kbps = usage_kbps - budget;
                warn!(
                    selector = ?policy.selector,
                    budget_kbps = budget,
                    usage_kbps,
                    overage_kbps,
                    "QoS budget exceeded"
                );
                UsageEvent::Exceeded {
                    selector: policy.selector,
                    budget_kbps: policy.bandwidth_kbps,
                    usage_kbps,
                    overage_kbps,
                }
            } else {
                info!(
                    selector = ?policy.selector,
                    budget_kbps = budget,
                    usage_kbps,
                    "QoS within budget"
                );
                UsageEvent::WithinBudget {
                    selector: policy.selector,
                    budget_kbps: policy.bandwidth_kbps,
                    usage_kbps,
                }
            };

            // No subscribers is fine.
            let _ = self.events.send(event.clone());
            events.push(event);
        }

        events
    }

    /// Samples every interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "Usage monitor started");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Usage monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_once();
                }
            }
        }
    }

    /// Spawns [`Self::run`] on the runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

/// Reports a random usage between 0 and the budget plus 100 kbit/s. Useful to exercise the
/// alerting path without traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedSampler;

impl UsageSampler for SimulatedSampler {
    fn sample(&self, policy: &ActivePolicy) -> Option<u64> {
        let max = policy.bandwidth_kbps as u64 + 100;
        Some(rand::thread_rng().gen_range(0..=max))
    }
}

#[derive(Debug, Clone, Copy)]
struct MeterCounter {
    bytes: u64,
    uptime: Duration,
    kbps: Option<u64>,
}

/// Derives usage from meter statistics. Each pass asks every switch for its meter counters;
/// the rate of a meter is the byte delta between its last two replies, and the usage of a
/// policy is the highest rate among its meters on any switch.
#[derive(Debug, Clone)]
pub struct MeterStatsSampler {
    inner: Arc<MeterStatsInner>,
}

#[derive(Debug)]
struct MeterStatsInner {
    registry: Arc<SwitchRegistry>,
    counters: Mutex<FxHashMap<(DatapathId, u32), MeterCounter>>,
}

impl MeterStatsSampler {
    /// Creates a sampler that polls every switch in `registry`.
    pub fn new(registry: Arc<SwitchRegistry>) -> Self {
        Self {
            inner: Arc::new(MeterStatsInner {
                registry,
                counters: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Records a meter statistics reply from a switch.
    pub fn record(&self, dpid: DatapathId, stats: &[MeterStats]) {
        let mut counters = self.inner.counters.lock();

        for meter in stats {
            let uptime = Duration::new(meter.duration_sec as u64, meter.duration_nsec);
            let key = (dpid, meter.meter_id);

            let kbps = counters.get(&key).and_then(|previous| {
                // A meter that was re-created restarts its counters.
                if uptime <= previous.uptime || meter.byte_in_count < previous.bytes {
                    return None;
                }
                Some(bytes_to_kbps(meter.byte_in_count - previous.bytes, uptime - previous.uptime))
            });

            counters.insert(key, MeterCounter { bytes: meter.byte_in_count, uptime, kbps });
        }
    }

    /// Returns the last computed rate of a meter, the highest across switches.
    pub fn rate(&self, meter_id: u32) -> Option<u64> {
        self.inner
            .counters
            .lock()
            .iter()
            .filter(|((_, id), _)| *id == meter_id)
            .filter_map(|(_, counter)| counter.kbps)
            .max()
    }

    /// Drops the counters of a switch that went away.
    pub fn forget(&self, dpid: DatapathId) {
        self.inner.counters.lock().retain(|(switch, _), _| *switch != dpid);
    }
}

impl UsageSampler for MeterStatsSampler {
    fn on_tick(&self) {
        for switch in self.inner.registry.list() {
            // Failures are logged by the handle.
            let _ = switch.request_meter_stats();
        }
    }

    fn sample(&self, policy: &ActivePolicy) -> Option<u64> {
        policy.meter_ids.iter().filter_map(|id| self.rate(*id)).max()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ofqos_wire::{Body, Message, MultipartRequest, OFPM_ALL};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        policy::{PolicyUpdate, Protocol, QosConfig},
        SwitchHandle,
    };

    struct Fixed(u64);

    impl UsageSampler for Fixed {
        fn sample(&self, _policy: &ActivePolicy) -> Option<u64> {
            Some(self.0)
        }
    }

    fn engine_with_policy(bw: u32) -> Arc<PolicyEngine> {
        let engine = Arc::new(PolicyEngine::new(QosConfig::default(), Arc::default()));
        engine
            .update_policy(PolicyUpdate::new(bw, Selector::port_list(Protocol::Udp, [5000, 6000])))
            .unwrap();
        engine
    }

    #[test]
    fn usage_above_budget_raises_one_alert() {
        let monitor = UsageMonitor::new(engine_with_policy(1000), Fixed(1200));
        let mut rx = monitor.subscribe();

        let events = monitor.run_once();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            UsageEvent::Exceeded { budget_kbps: 1000, usage_kbps: 1200, overage_kbps: 200, .. }
        ));

        assert_eq!(rx.try_recv().unwrap(), events[0]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn usage_within_budget_is_ok() {
        let monitor = UsageMonitor::new(engine_with_policy(1000), Fixed(800));

        let events = monitor.run_once();
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_exceeded());
        assert!(matches!(events[0], UsageEvent::WithinBudget { usage_kbps: 800, .. }));
    }

    #[test]
    fn missing_samples_are_skipped() {
        struct Nothing(AtomicUsize);

        impl UsageSampler for Nothing {
            fn on_tick(&self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }

            fn sample(&self, _policy: &ActivePolicy) -> Option<u64> {
                None
            }
        }

        let monitor = UsageMonitor::new(engine_with_policy(1000), Nothing(AtomicUsize::new(0)));
        assert!(monitor.run_once().is_empty());
        assert_eq!(monitor.sampler.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn simulated_sampler_stays_in_range() {
        let policy = engine_with_policy(50).snapshot().remove(0);
        for _ in 0..100 {
            assert!(SimulatedSampler.sample(&policy).unwrap() <= 150);
        }
    }

    #[test]
    fn meter_rate_from_counter_deltas() {
        let sampler = MeterStatsSampler::new(Arc::default());
        let dpid = DatapathId(1);
        let stats = |bytes, secs| MeterStats {
            meter_id: 1,
            byte_in_count: bytes,
            duration_sec: secs,
            ..Default::default()
        };

        sampler.record(dpid, &[stats(0, 10)]);
        assert_eq!(sampler.rate(1), None);

        // 125_000 bytes in 10s is 100 kbit/s.
        sampler.record(dpid, &[stats(125_000, 20)]);
        assert_eq!(sampler.rate(1), Some(100));

        // Another switch carrying more traffic through the same meter id.
        sampler.record(DatapathId(2), &[stats(0, 1)]);
        sampler.record(DatapathId(2), &[stats(250_000, 11)]);
        assert_eq!(sampler.rate(1), Some(200));

        sampler.forget(DatapathId(2));
        assert_eq!(sampler.rate(1), Some(100));

        // Counter reset.
        sampler.record(dpid, &[stats(10, 1)]);
        assert_eq!(sampler.rate(1), None);
    }

    #[test]
    fn meter_sampler_requests_stats_on_tick() {
        let registry = Arc::new(SwitchRegistry::new());
        let (tx, mut rx) = mpsc::channel::<Message>(8);
        registry.register(SwitchHandle::new(DatapathId(1), tx, Arc::default()));

        let sampler = MeterStatsSampler::new(registry);
        sampler.on_tick();

        assert_eq!(
            rx.try_recv().unwrap().into_body(),
            Body::MultipartRequest(MultipartRequest::MeterStats { meter_id: OFPM_ALL })
        );
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let _ = tracing_subscriber::fmt::try_init();

        let monitor = UsageMonitor::new(engine_with_policy(1000), Fixed(1200))
            .with_interval(Duration::from_millis(10));
        let mut rx = monitor.subscribe();
        let cancel = CancellationToken::new();
        let task = monitor.spawn(cancel.clone());

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(event.is_exceeded());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
