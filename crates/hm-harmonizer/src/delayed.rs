//! Registry of scheduled restarts.
//!
//! A restart is first reserved, then its timer handle is attached once the
//! scheduler returned it. A timer that fires claims its reservation with
//! [`DelayedRestarts::take`]; if the reservation is gone the restart was
//! cancelled and must not run.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hm_types::{DropletId, InstanceKey};
use tracing::debug;

use crate::collaborators::TimerHandle;

/// Claim on a reserved restart slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartTicket {
    pub droplet_id: DropletId,
    pub instance: InstanceKey,
    id: u64,
}

struct PendingRestart {
    id: u64,
    delay: Duration,
    scheduled_at: DateTime<Utc>,
    handle: Option<Box<dyn TimerHandle>>,
}

impl PendingRestart {
    fn cancel(self) {
        if let Some(handle) = self.handle {
            handle.cancel();
        }
    }
}

/// Snapshot of a pending restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRestartInfo {
    pub instance: InstanceKey,
    pub delay: Duration,
    pub scheduled_at: DateTime<Utc>,
}

/// Pending restarts keyed by droplet, then by (version, index).
#[derive(Default)]
pub struct DelayedRestarts {
    pending: DashMap<DropletId, HashMap<InstanceKey, PendingRestart>>,
    next_id: AtomicU64,
}

impl DelayedRestarts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the slot for a restart after `delay`. Returns `None` when a
    /// restart is already pending for it.
    pub fn reserve(
        &self,
        droplet_id: &DropletId,
        instance: &InstanceKey,
        delay: Duration,
    ) -> Option<RestartTicket> {
        let mut entry = self.pending.entry(droplet_id.clone()).or_default();
        if entry.contains_key(instance) {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entry.insert(
            instance.clone(),
            PendingRestart {
                id,
                delay,
                scheduled_at: Utc::now(),
                handle: None,
            },
        );

        Some(RestartTicket {
            droplet_id: droplet_id.clone(),
            instance: instance.clone(),
            id,
        })
    }

    /// Attach the timer handle to a reservation. If the reservation was
    /// cancelled or has fired meanwhile, the handle is cancelled instead.
    pub fn attach(&self, ticket: &RestartTicket, handle: Box<dyn TimerHandle>) {
        let orphan = match self.pending.get_mut(&ticket.droplet_id) {
            Some(mut restarts) => match restarts.get_mut(&ticket.instance) {
                Some(pending) if pending.id == ticket.id => {
                    pending.handle = Some(handle);
                    None
                }
                _ => Some(handle),
            },
            None => Some(handle),
        };

        if let Some(handle) = orphan {
            handle.cancel();
        }
    }

    /// Claim a reservation whose timer fired. Returns `false` when it was
    /// cancelled in the meantime.
    pub fn take(&self, ticket: &RestartTicket) -> bool {
        let claimed = match self.pending.get_mut(&ticket.droplet_id) {
            Some(mut restarts) => {
                let owned = matches!(
                    restarts.get(&ticket.instance),
                    Some(pending) if pending.id == ticket.id
                );
                if owned {
                    restarts.remove(&ticket.instance);
                }
                owned
            }
            None => false,
        };

        self.forget_if_empty(&ticket.droplet_id);
        claimed
    }

    /// Cancel the restart pending for one slot. Returns `false` if none was.
    pub fn cancel(&self, droplet_id: &DropletId, instance: &InstanceKey) -> bool {
        let removed = self
            .pending
            .get_mut(droplet_id)
            .and_then(|mut restarts| restarts.remove(instance));
        self.forget_if_empty(droplet_id);

        match removed {
            Some(pending) => {
                pending.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every restart pending for a droplet. Returns how many were.
    pub fn cancel_all(&self, droplet_id: &DropletId) -> usize {
        let Some((_, restarts)) = self.pending.remove(droplet_id) else {
            return 0;
        };

        let cancelled = restarts.len();
        for pending in restarts.into_values() {
            pending.cancel();
        }

        if cancelled > 0 {
            debug!(droplet_id = %droplet_id, cancelled, "Cancelled delayed restarts");
        }
        cancelled
    }

    pub fn is_pending(&self, droplet_id: &DropletId, instance: &InstanceKey) -> bool {
        self.pending
            .get(droplet_id)
            .is_some_and(|restarts| restarts.contains_key(instance))
    }

    /// Pending restarts of one droplet, ordered by instance.
    pub fn pending_for(&self, droplet_id: &DropletId) -> Vec<PendingRestartInfo> {
        let mut pending: Vec<_> = self
            .pending
            .get(droplet_id)
            .map(|restarts| {
                restarts
                    .iter()
                    .map(|(instance, p)| PendingRestartInfo {
                        instance: instance.clone(),
                        delay: p.delay,
                        scheduled_at: p.scheduled_at,
                    })
                    .collect()
            })
            .unwrap_or_default();
        pending.sort_by(|a, b| a.instance.cmp(&b.instance));
        pending
    }

    /// Total pending restarts across droplets.
    pub fn len(&self) -> usize {
        self.pending.iter().map(|r| r.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget_if_empty(&self, droplet_id: &DropletId) {
        self.pending
            .remove_if(droplet_id, |_, restarts| restarts.is_empty());
    }
}

impl fmt::Debug for DelayedRestarts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedRestarts")
            .field("pending", &self.len())
            .finish()
    }
}
