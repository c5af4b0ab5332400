//! `ofqosd`: runs the controller, the usage monitor and the control API.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use ofqos::{
    api::{self, ApiVariant},
    policy::CLASS_COUNT,
    tcp::Tcp,
    Controller, ControllerOptions, QosConfig, SimulatedSampler, UsageMonitor,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum UsageSource {
    /// Byte counters of the switch meters.
    MeterStats,
    /// Random values around each budget.
    Simulated,
}

#[derive(Debug, Parser)]
#[command(name = "ofqosd", version, about = "OpenFlow 1.3 learning switch with meter-based QoS")]
struct Args {
    #[arg(
        long,
        env = "OFQOS_LISTEN",
        default_value = "0.0.0.0:6653",
        help = "OpenFlow listen address"
    )]
    listen: SocketAddr,

    #[arg(
        long,
        env = "OFQOS_HTTP",
        default_value = "0.0.0.0:8080",
        help = "Control API listen address"
    )]
    http: SocketAddr,

    #[arg(
        long,
        env = "OFQOS_QOS_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Install the class meters and meter learned TCP/UDP flows"
    )]
    qos_enabled: bool,

    #[arg(
        long,
        env = "OFQOS_CLASS_BANDWIDTH",
        value_delimiter = ',',
        default_value = "1000,1000,1000,1000,1000,1000,1000,1000",
        help = "Budgets of classes 1 through 8 in kbit/s, comma separated"
    )]
    class_bandwidth: Vec<u32>,

    #[arg(
        long,
        env = "OFQOS_BEST_EFFORT_BANDWIDTH",
        default_value_t = 1000,
        help = "Best-effort budget in kbit/s"
    )]
    best_effort_bandwidth: u32,

    #[arg(
        long,
        env = "OFQOS_TOTAL_CAPACITY",
        default_value_t = 15_000,
        help = "Link capacity in kbit/s"
    )]
    total_capacity: u64,

    #[arg(
        long,
        env = "OFQOS_MONITOR_INTERVAL",
        default_value_t = 10,
        help = "Seconds between usage checks"
    )]
    monitor_interval: u64,

    #[arg(long, env = "OFQOS_USAGE_SOURCE", value_enum, default_value_t = UsageSource::MeterStats)]
    usage_source: UsageSource,

    #[arg(
        long,
        env = "OFQOS_API_VARIANT",
        default_value = "two-port",
        help = "Body accepted by POST /qos/update, 'two-port' or 'eight-port'"
    )]
    api_variant: ApiVariant,

    #[arg(
        long,
        env = "OFQOS_FLOW_IDLE_TIMEOUT",
        default_value_t = 30,
        help = "Idle timeout of learned rules, in seconds"
    )]
    flow_idle_timeout: u16,

    #[arg(
        long,
        env = "OFQOS_FLOW_HARD_TIMEOUT",
        default_value_t = 0,
        help = "Hard timeout of learned rules, 0 to disable"
    )]
    flow_hard_timeout: u16,

    #[arg(
        long,
        env = "OFQOS_ADDRESS_TABLE_CAPACITY",
        default_value_t = 4096,
        help = "Learned addresses per switch"
    )]
    address_table_capacity: usize,

    #[arg(long, env = "OFQOS_ADDRESS_TTL", help = "Forget addresses unseen for this many seconds")]
    address_ttl: Option<u64>,

    #[arg(long, env = "OFQOS_MAX_SWITCHES", help = "Maximum number of connected switches")]
    max_switches: Option<usize>,
}

impl Args {
    fn qos_config(&self) -> anyhow::Result<QosConfig> {
        let Ok(class_bandwidth_kbps) =
            <[u32; CLASS_COUNT]>::try_from(self.class_bandwidth.as_slice())
        else {
            bail!(
                "expected {CLASS_COUNT} class bandwidths, got {}",
                self.class_bandwidth.len()
            );
        };

        Ok(QosConfig {
            enabled: self.qos_enabled,
            class_bandwidth_kbps,
            best_effort_kbps: self.best_effort_bandwidth,
            total_capacity_kbps: self.total_capacity,
        })
    }

    fn controller_options(&self) -> ControllerOptions {
        let mut options = ControllerOptions::default()
            .flow_idle_timeout(self.flow_idle_timeout)
            .flow_hard_timeout(self.flow_hard_timeout)
            .address_table_capacity(self.address_table_capacity);

        if let Some(ttl) = self.address_ttl {
            options = options.address_ttl(Duration::from_secs(ttl));
        }
        if let Some(max) = self.max_switches {
            options = options.max_switches(max);
        }

        options
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy();

    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let qos = args.qos_config()?;
    let mut controller: Controller<Tcp, SocketAddr> =
        Controller::new(Tcp::default(), args.controller_options(), qos);
    controller
        .bind(args.listen)
        .await
        .with_context(|| format!("failed to listen for switches on {}", args.listen))?;

    info!(
        listen = ?controller.local_addr(),
        qos_enabled = controller.policy().is_enabled(),
        capacity = ?controller.policy().check_capacity(),
        "Controller started"
    );

    let cancel = CancellationToken::new();
    let interval = Duration::from_secs(args.monitor_interval.max(1));
    let policy = Arc::clone(controller.policy());

    let monitor: JoinHandle<()> = match args.usage_source {
        UsageSource::MeterStats => {
            UsageMonitor::new(policy.clone(), controller.meter_stats().clone())
                .with_interval(interval)
                .spawn(cancel.clone())
        }
        UsageSource::Simulated => UsageMonitor::new(policy.clone(), SimulatedSampler)
            .with_interval(interval)
            .spawn(cancel.clone()),
    };

    let mut api = tokio::spawn(api::serve(args.http, policy, args.api_variant, cancel.clone()));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("Shutting down");
        }
        res = &mut api => {
            res.context("control API task failed")?.context("control API failed")?;
            bail!("control API stopped unexpectedly");
        }
    }

    cancel.cancel();
    monitor.await.context("usage monitor task failed")?;
    api.await.context("control API task failed")?.context("control API failed")?;

    info!(
        switches = controller.stats().active_switches(),
        messages_rx = controller.stats().messages_rx(),
        messages_tx = controller.stats().messages_tx(),
        "Controller stopped"
    );

    Ok(())
}
