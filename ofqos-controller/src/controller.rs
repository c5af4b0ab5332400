use std::{net::SocketAddr, sync::Arc};

use futures::stream::FuturesUnordered;
use ofqos_transport::{Address, Transport};
use tokio::{
    net::{lookup_host, ToSocketAddrs},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, warn};

use crate::{
    driver::ControllerDriver, ControllerError, ControllerOptions, ControllerStats, Dispatcher,
    LearningSwitch, MeterStatsSampler, PolicyEngine, QosConfig, SwitchRegistry,
};

/// The controller front-end. Owns the shared state and, once bound, the task accepting
/// switch connections.
///
/// The state is available as soon as the controller is created, so that the usage monitor
/// and the control API can be wired to it before any switch connects.
pub struct Controller<T: Transport<A>, A: Address> {
    options: Arc<ControllerOptions>,
    stats: Arc<ControllerStats>,
    registry: Arc<SwitchRegistry>,
    policy: Arc<PolicyEngine>,
    learning: Arc<LearningSwitch>,
    meter_stats: MeterStatsSampler,
    /// The transport used by this controller. Moved to the driver task once bound.
    transport: Option<T>,
    /// The local address this controller is bound to.
    local_addr: Option<A>,
    /// Internal task representing a running [`ControllerDriver`].
    driver_task: Option<JoinHandle<Result<(), ControllerError>>>,
}

impl<T> Controller<T, SocketAddr>
where
    T: Transport<SocketAddr>,
{
    /// Binds the controller to the given socket address.
    pub async fn bind(&mut self, addr: impl ToSocketAddrs) -> Result<(), ControllerError> {
        let addrs = lookup_host(addr).await?;
        self.try_bind(addrs.collect()).await
    }
}

impl<T, A> Controller<T, A>
where
    T: Transport<A>,
    A: Address,
{
    /// Creates a controller that accepts switches over `transport`.
    pub fn new(transport: T, options: ControllerOptions, qos: QosConfig) -> Self {
        let registry = Arc::new(SwitchRegistry::new());
        let policy = Arc::new(PolicyEngine::new(qos, Arc::clone(&registry)));
        let learning = Arc::new(LearningSwitch::new(&options, Arc::clone(&policy)));
        let meter_stats = MeterStatsSampler::new(Arc::clone(&registry));

        Self {
            options: Arc::new(options),
            stats: Arc::default(),
            registry,
            policy,
            learning,
            meter_stats,
            transport: Some(transport),
            local_addr: None,
            driver_task: None,
        }
    }

    /// Binds to the first address that works and spawns the driver task.
    pub async fn try_bind(&mut self, addresses: Vec<A>) -> Result<(), ControllerError> {
        let Some(mut transport) = self.transport.take() else {
            return Err(ControllerError::AlreadyBound);
        };

        for addr in addresses {
            match transport.bind(addr.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(err = ?e, ?addr, "Failed to bind");
                    continue;
                }
            }
        }

        let Some(local_addr) = transport.local_addr() else {
            self.transport = Some(transport);
            return Err(ControllerError::NoValidEndpoints);
        };

        let span = tracing::info_span!(parent: None, "controller", ?local_addr);
        span.in_scope(|| debug!("Listening for switches"));

        let driver = ControllerDriver {
            transport,
            options: Arc::clone(&self.options),
            dispatcher: self.dispatcher(),
            stats: Arc::clone(&self.stats),
            conn_tasks: FuturesUnordered::new(),
            sessions: JoinSet::new(),
            span,
        };

        self.driver_task = Some(tokio::spawn(driver));
        self.local_addr = Some(local_addr);

        Ok(())
    }

    /// Returns the local address this controller is bound to. `None` if not bound.
    pub fn local_addr(&self) -> Option<&A> {
        self.local_addr.as_ref()
    }

    /// Returns the controller counters.
    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Returns the registry of connected switches.
    pub fn registry(&self) -> &Arc<SwitchRegistry> {
        &self.registry
    }

    /// Returns the policy engine.
    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    /// Returns the learning switch.
    pub fn learning(&self) -> &Arc<LearningSwitch> {
        &self.learning
    }

    /// The sampler fed by the meter statistics replies of every switch.
    pub fn meter_stats(&self) -> &MeterStatsSampler {
        &self.meter_stats
    }

    /// Returns a dispatcher bound to this controller's state.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.policy),
            Arc::clone(&self.learning),
            self.meter_stats.clone(),
            Arc::clone(&self.stats),
        )
    }
}

impl<T: Transport<A>, A: Address> Drop for Controller<T, A> {
    fn drop(&mut self) {
        if let Some(task) = self.driver_task.take() {
            task.abort();
        }
    }
}
