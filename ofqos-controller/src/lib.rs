//! An OpenFlow 1.3 controller that runs a learning switch on every connected datapath and
//! enforces per-flow bandwidth budgets with meters.
//!
//! The [`Controller`] accepts switch connections and spawns one session per switch. Each
//! session decodes the switch's messages and hands them, in arrival order, to the
//! [`Dispatcher`], which routes them to the [`SwitchRegistry`], the [`LearningSwitch`] and
//! the [`PolicyEngine`]. The [`UsageMonitor`] and the HTTP control API ([`api::router`]) run
//! next to it as independent tasks.

use std::{fmt, io};

use thiserror::Error;

pub mod api;
mod controller;
mod dispatch;
mod driver;
pub mod learning;
pub mod monitor;
mod options;
pub mod policy;
mod programmer;
mod registry;
mod session;
mod stats;

pub use api::ApiVariant;
pub use controller::Controller;
pub use dispatch::{Dispatcher, SwitchEvent};
pub use learning::{ForwardDecision, LearningSwitch};
pub use monitor::{
    MeterStatsSampler, SimulatedSampler, UsageEvent, UsageMonitor, UsageSampler,
    DEFAULT_MONITOR_INTERVAL,
};
pub use options::{ControllerOptions, DEFAULT_QUEUE_SIZE};
pub use policy::{PolicyEngine, PolicyError, PolicyService, QosConfig};
pub use programmer::{FlowOptions, DEFAULT_FLOW_PRIORITY, TABLE_MISS_PRIORITY};
pub use registry::{SwitchHandle, SwitchRegistry};
pub use stats::ControllerStats;

/// The 64-bit identifier a switch reports in its features reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatapathId(pub u64);

impl fmt::Display for DatapathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for DatapathId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Errors of the controller lifecycle.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Binding or accepting failed.
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    /// A message could not be framed.
    #[error("Wire protocol error: {0:?}")]
    Wire(#[from] ofqos_wire::Error),
    /// None of the given endpoints could be bound.
    #[error("Could not bind to any valid endpoints")]
    NoValidEndpoints,
    /// [`Controller::bind`] was called twice.
    #[error("Controller is already bound")]
    AlreadyBound,
    /// The transport failed.
    #[error("Transport error: {0:?}")]
    Transport(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Failure to queue a message for a switch. The message is dropped.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SendError {
    /// The switch is not connected or its session has ended.
    #[error("Switch {0} is unreachable")]
    Unreachable(DatapathId),
    /// The egress queue of the switch is full.
    #[error("Egress queue of switch {0} is full")]
    Backpressure(DatapathId),
    /// The message doesn't fit the 16-bit OpenFlow length.
    #[error("Message of {len} bytes for switch {dpid} exceeds the OpenFlow length limit")]
    TooLarge {
        /// The switch the message was for.
        dpid: DatapathId,
        /// Encoded length of the message.
        len: usize,
    },
}

/// Errors of registry lookups.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No switch with this datapath id is connected.
    #[error("Switch {0} not found")]
    NotFound(DatapathId),
}
