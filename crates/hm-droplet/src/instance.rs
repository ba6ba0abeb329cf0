//! Instance records: the latest observation of one instance slot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hm_types::{DropletId, InstanceIndex, InstanceKey, InstanceState, Version};
use serde::{Deserialize, Serialize};

use crate::crash::{within, CrashHistory};

/// Latest known classification of a (droplet, version, index) slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Owning droplet.
    pub droplet_id: DropletId,

    /// Version and index of the slot.
    pub key: InstanceKey,

    /// State from the most recent report.
    pub state: InstanceState,

    /// Agent timestamp of the most recent report.
    pub last_heartbeat: DateTime<Utc>,

    /// Crash bookkeeping for this slot.
    pub crashes: CrashHistory,

    /// Agent timestamp of the last exit notice applied to this slot.
    pub last_exit_at: Option<DateTime<Utc>>,

    /// Droplet-local ordering of reports, breaks timestamp ties.
    pub(crate) sequence: u64,
}

impl InstanceRecord {
    pub(crate) fn new(
        droplet_id: DropletId,
        key: InstanceKey,
        state: InstanceState,
        reported_at: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self {
            droplet_id,
            key,
            state,
            last_heartbeat: reported_at,
            crashes: CrashHistory::new(),
            last_exit_at: None,
            sequence,
        }
    }

    pub fn version(&self) -> &Version {
        &self.key.version
    }

    pub fn index(&self) -> InstanceIndex {
        self.key.index
    }

    pub fn crash_count(&self) -> u32 {
        self.crashes.crash_count()
    }

    pub fn last_crash_at(&self) -> Option<DateTime<Utc>> {
        self.crashes.last_crash_at()
    }

    /// Reported within `staleness` of `now`.
    pub fn is_fresh(&self, staleness: Duration, now: DateTime<Utc>) -> bool {
        within(self.last_heartbeat, now, staleness)
    }

    /// Fresh and in a running state: the slot is occupied.
    pub fn is_live(&self, staleness: Duration, now: DateTime<Utc>) -> bool {
        self.state.is_running() && self.is_fresh(staleness, now)
    }

    /// Fresh and not known to be gone. Such an instance may still be
    /// consuming resources on its agent.
    pub fn is_present(&self, staleness: Duration, now: DateTime<Utc>) -> bool {
        !matches!(self.state, InstanceState::Crashed | InstanceState::Down)
            && self.is_fresh(staleness, now)
    }

    /// Report ordering: later timestamp wins, ingestion order breaks ties.
    pub(crate) fn recency(&self) -> (DateTime<Utc>, u64) {
        (self.last_heartbeat, self.sequence)
    }
}
