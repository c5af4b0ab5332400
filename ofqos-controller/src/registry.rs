use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use ofqos_wire::{Body, Message};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::{ControllerStats, DatapathId, RegistryError, SendError};

/// A cheap, cloneable handle to a connected switch. Messages sent through the handle are
/// queued on the switch's session, which writes them to the connection.
#[derive(Debug, Clone)]
pub struct SwitchHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    dpid: DatapathId,
    /// Egress queue of the switch session.
    to_session: mpsc::Sender<Message>,
    /// Transaction id counter.
    xid: AtomicU32,
    stats: Arc<ControllerStats>,
}

impl SwitchHandle {
    /// Creates a new handle that queues messages on `to_session`.
    pub fn new(
        dpid: DatapathId,
        to_session: mpsc::Sender<Message>,
        stats: Arc<ControllerStats>,
    ) -> Self {
        Self { inner: Arc::new(HandleInner { dpid, to_session, xid: AtomicU32::new(1), stats }) }
    }

    /// The datapath id of the switch.
    #[inline]
    pub fn dpid(&self) -> DatapathId {
        self.inner.dpid
    }

    /// Returns `true` while the switch session is alive.
    pub fn is_connected(&self) -> bool {
        !self.inner.to_session.is_closed()
    }

    /// Returns `true` if both handles refer to the same connection.
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns a fresh transaction id.
    pub fn next_xid(&self) -> u32 {
        self.inner.xid.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues `body` with a fresh transaction id, returning the id. Never waits: a closed
    /// or full queue fails immediately and the message is dropped.
    pub fn send(&self, body: Body) -> Result<u32, SendError> {
        let xid = self.next_xid();
        self.send_with_xid(xid, body)?;
        Ok(xid)
    }

    /// Queues `body` with the given transaction id.
    pub fn send_with_xid(&self, xid: u32, body: Body) -> Result<(), SendError> {
        match self.inner.to_session.try_send(Message::new(xid, body)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                self.inner.stats.increment_failed_sends();
                warn!(
                    dpid = %self.dpid(),
                    kind = msg.kind(),
                    "Egress queue full, dropping message"
                );
                Err(SendError::Backpressure(self.dpid()))
            }
            Err(TrySendError::Closed(msg)) => {
                self.inner.stats.increment_failed_sends();
                warn!(
                    dpid = %self.dpid(),
                    kind = msg.kind(),
                    "Switch unreachable, dropping message"
                );
                Err(SendError::Unreachable(self.dpid()))
            }
        }
    }
}

/// Tracks the switches that are currently connected.
#[derive(Debug, Default)]
pub struct SwitchRegistry {
    switches: RwLock<FxHashMap<DatapathId, SwitchHandle>>,
}

impl SwitchRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly connected switch. If a session for the same datapath id was still
    /// registered (the switch reconnected before the old connection was torn down), it is
    /// replaced and returned.
    pub fn register(&self, handle: SwitchHandle) -> Option<SwitchHandle> {
        let dpid = handle.dpid();
        let previous = self.switches.write().insert(dpid, handle);

        if previous.is_some() {
            warn!(%dpid, "Switch reconnected, replacing previous session");
        } else {
            info!(%dpid, "Switch registered");
        }

        previous
    }

    /// Returns the handle of a connected switch.
    pub fn get(&self, dpid: DatapathId) -> Result<SwitchHandle, RegistryError> {
        self.switches.read().get(&dpid).cloned().ok_or(RegistryError::NotFound(dpid))
    }

    /// Returns handles to all connected switches.
    pub fn list(&self) -> Vec<SwitchHandle> {
        self.switches.read().values().cloned().collect()
    }

    /// Removes a switch regardless of which connection registered it.
    pub fn remove(&self, dpid: DatapathId) -> Option<SwitchHandle> {
        let removed = self.switches.write().remove(&dpid);
        if removed.is_some() {
            info!(%dpid, "Switch removed");
        }
        removed
    }

    /// Removes the switch only if it is still registered through `handle`'s connection.
    /// Returns `true` if it was removed.
    pub fn unregister(&self, handle: &SwitchHandle) -> bool {
        let mut switches = self.switches.write();

        match switches.get(&handle.dpid()) {
            Some(current) if current.same_connection(handle) => {
                switches.remove(&handle.dpid());
                info!(dpid = %handle.dpid(), "Switch disconnected");
                true
            }
            _ => {
                debug!(dpid = %handle.dpid(), "Stale session closed, switch already re-registered");
                false
            }
        }
    }

    /// Number of connected switches.
    pub fn len(&self) -> usize {
        self.switches.read().len()
    }

    /// Returns `true` if no switch is connected.
    pub fn is_empty(&self) -> bool {
        self.switches.read().is_empty()
    }
}
