//! Desired-state access.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use hm_types::{DesiredState, DropletId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{HarmonizerError, HarmonizerResult};

/// Read access to the authority holding each droplet's desired state.
pub trait DesiredStateProvider: Send + Sync {
    /// The provider has data it trusts. Destructive actions are suppressed
    /// while this is false.
    fn is_available(&self) -> bool;

    /// Desired state of one droplet, `None` when the droplet is not wanted.
    fn get(&self, droplet_id: &DropletId) -> Option<DesiredState>;

    /// Every droplet with a desired state.
    fn droplet_ids(&self) -> Vec<DropletId>;

    /// Ask for the droplet's desired state to be refreshed.
    ///
    /// Fire-and-forget. Completion is reported back through
    /// `Harmonizer::on_desired_state_refreshed`, never synchronously from
    /// inside this call.
    fn request_update(&self, droplet_id: &DropletId) -> HarmonizerResult<()>;
}

/// Desired state held in memory.
///
/// Refresh requests are forwarded on an optional channel so a driver can
/// reload the data and acknowledge them.
#[derive(Debug)]
pub struct InMemoryDesiredState {
    entries: RwLock<BTreeMap<DropletId, DesiredState>>,
    available: AtomicBool,
    refresh_tx: Option<mpsc::UnboundedSender<DropletId>>,
    requests: Mutex<Vec<DropletId>>,
}

impl InMemoryDesiredState {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            refresh_tx: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a store that forwards refresh requests to the returned receiver.
    pub fn with_refresh_channel() -> (Self, mpsc::UnboundedReceiver<DropletId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Self {
            refresh_tx: Some(tx),
            ..Self::new()
        };
        (store, rx)
    }

    pub fn set(&self, droplet_id: DropletId, desired: DesiredState) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(droplet_id, desired);
    }

    pub fn remove(&self, droplet_id: &DropletId) -> Option<DesiredState> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(droplet_id)
    }

    /// Swap in a complete snapshot.
    pub fn replace_all(&self, entries: BTreeMap<DropletId, DesiredState>) {
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = entries;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Droplets whose refresh was requested, in request order.
    pub fn update_requests(&self) -> Vec<DropletId> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for InMemoryDesiredState {
    fn default() -> Self {
        Self::new()
    }
}

impl DesiredStateProvider for InMemoryDesiredState {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn get(&self, droplet_id: &DropletId) -> Option<DesiredState> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(droplet_id)
            .cloned()
    }

    fn droplet_ids(&self) -> Vec<DropletId> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn request_update(&self, droplet_id: &DropletId) -> HarmonizerResult<()> {
        debug!(droplet_id = %droplet_id, "Desired state update requested");
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(droplet_id.clone());

        if let Some(tx) = &self.refresh_tx {
            tx.send(droplet_id.clone())
                .map_err(|_| HarmonizerError::ChannelClosed("desired state refresh"))?;
        }
        Ok(())
    }
}
