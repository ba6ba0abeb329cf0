//! Droplet state machine.
//!
//! A [`Droplet`] tracks every instance slot of one deployable unit across
//! versions. Agent reports are folded in with [`Droplet::process_heartbeat`]
//! and [`Droplet::process_exit`]; neither emits events. Events are raised by
//! the comparison pass, [`Droplet::analyze`], which diffs the slots against
//! the desired state and publishes the result on the controller's bus.
//!
//! Writers are expected to serialize per droplet by holding
//! [`Droplet::begin_pass`] while ingesting a batch and running the pass.
//! Listeners may freely read the droplet while events are being delivered:
//! no internal lock is held during delivery.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use hm_types::{
    DesiredState, DropletId, ExitNotice, ExitReason, Heartbeat, InstanceIndex, InstanceKey,
    InstanceState, Version,
};
use tracing::{debug, trace};

use crate::config::DropletConfig;
use crate::error::{DropletError, DropletResult};
use crate::events::{DropletEvent, EventBus};
use crate::instance::InstanceRecord;

/// What a heartbeat did to its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Older than, or identical to, what the slot already holds.
    Ignored,
    /// Same state, newer timestamp.
    Refreshed,
    /// The slot changed state.
    Transitioned {
        from: InstanceState,
        to: InstanceState,
    },
    /// First report for the slot.
    Created,
}

impl HeartbeatOutcome {
    /// The report changed the droplet's classification.
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            HeartbeatOutcome::Transitioned { .. } | HeartbeatOutcome::Created
        )
    }
}

/// What an exit notice did to its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Duplicate or superseded by a later report.
    Ignored,
    /// Queued for the next comparison pass.
    Queued,
    /// The instance was stopped on purpose; its slot was dropped.
    Removed,
}

/// Result of one comparison pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisReport {
    pub missing: Vec<InstanceIndex>,
    pub extra: Vec<InstanceKey>,
    pub exited_with_host: Vec<InstanceIndex>,
    pub crashed: Vec<InstanceKey>,
}

impl AnalysisReport {
    /// Number of events the pass raised.
    pub fn event_count(&self) -> usize {
        usize::from(!self.missing.is_empty())
            + usize::from(!self.extra.is_empty())
            + self.exited_with_host.len()
            + self.crashed.len()
    }
}

#[derive(Debug, Clone)]
enum PendingExit {
    HostLost { index: InstanceIndex },
    Crashed { key: InstanceKey },
}

#[derive(Debug, Default)]
struct DropletState {
    slots: BTreeMap<InstanceKey, InstanceRecord>,
    pending_exits: Vec<PendingExit>,
    /// Desired state used by the last comparison pass.
    desired: Option<DesiredState>,
    sequence: u64,
}

impl DropletState {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn knows_version(&self, version: &Version) -> bool {
        self.slots.keys().any(|k| &k.version == version)
    }
}

/// All known instance slots of one deployable unit.
#[derive(Debug)]
pub struct Droplet {
    id: DropletId,
    config: DropletConfig,
    state: RwLock<DropletState>,
    desired_state_update_required: AtomicBool,
    pass: Mutex<()>,
}

impl Droplet {
    /// Create an empty droplet. Its desired state is unknown, so it starts
    /// out requiring a desired-state update.
    pub fn new(id: DropletId, config: DropletConfig) -> Self {
        Self {
            id,
            config,
            state: RwLock::new(DropletState::default()),
            desired_state_update_required: AtomicBool::new(true),
            pass: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &DropletId {
        &self.id
    }

    pub fn config(&self) -> &DropletConfig {
        &self.config
    }

    /// Serialize work on this droplet for as long as the guard lives.
    pub fn begin_pass(&self) -> MutexGuard<'_, ()> {
        self.pass.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn desired_state_update_required(&self) -> bool {
        self.desired_state_update_required.load(Ordering::SeqCst)
    }

    pub fn set_desired_state_update_required(&self, required: bool) {
        let previous = self
            .desired_state_update_required
            .swap(required, Ordering::SeqCst);
        if previous != required {
            debug!(
                droplet_id = %self.id,
                required,
                "Desired state update flag changed"
            );
        }
    }

    /// Desired state seen by the last comparison pass.
    pub fn last_desired_state(&self) -> Option<DesiredState> {
        self.read().desired.clone()
    }

    /// Fold one heartbeat into its slot.
    ///
    /// Reports no newer than the slot's latest are ignored, so duplicate and
    /// reordered heartbeats never move a slot backwards.
    pub fn process_heartbeat(&self, heartbeat: &Heartbeat) -> DropletResult<HeartbeatOutcome> {
        self.check_droplet(&heartbeat.droplet_id)?;

        let key = heartbeat.key();
        let window = self.config.flapping.window;
        let mut state = self.write();

        let first_of_version = !state.knows_version(&heartbeat.version);
        let sequence = state.next_sequence();

        let outcome = match state.slots.get_mut(&key) {
            Some(record) if heartbeat.timestamp <= record.last_heartbeat => {
                trace!(
                    droplet_id = %self.id,
                    instance = %key,
                    "Ignoring stale heartbeat"
                );
                return Ok(HeartbeatOutcome::Ignored);
            }
            Some(record) => {
                let from = record.state;
                record.state = heartbeat.state;
                record.last_heartbeat = heartbeat.timestamp;
                record.sequence = sequence;
                apply_crash_bookkeeping(record, Some(from), heartbeat.timestamp, window);

                if from == heartbeat.state {
                    HeartbeatOutcome::Refreshed
                } else {
                    HeartbeatOutcome::Transitioned {
                        from,
                        to: heartbeat.state,
                    }
                }
            }
            None => {
                let mut record = InstanceRecord::new(
                    self.id.clone(),
                    key.clone(),
                    heartbeat.state,
                    heartbeat.timestamp,
                    sequence,
                );
                apply_crash_bookkeeping(&mut record, None, heartbeat.timestamp, window);
                state.slots.insert(key.clone(), record);
                HeartbeatOutcome::Created
            }
        };

        let diverged = match &state.desired {
            Some(desired) if heartbeat.version != desired.live_version => first_of_version,
            Some(desired) => {
                outcome == HeartbeatOutcome::Created && !desired.wants_index(heartbeat.index)
            }
            None => false,
        };
        drop(state);

        if diverged {
            debug!(
                droplet_id = %self.id,
                instance = %key,
                "Heartbeat diverges from known desired state"
            );
            self.set_desired_state_update_required(true);
        }

        if outcome.is_change() {
            debug!(
                droplet_id = %self.id,
                instance = %key,
                state = %heartbeat.state,
                "Instance slot changed"
            );
        }

        Ok(outcome)
    }

    /// Fold one exit notice into its slot and queue the matching event for
    /// the next comparison pass.
    pub fn process_exit(&self, notice: &ExitNotice) -> DropletResult<ExitOutcome> {
        self.check_droplet(&notice.droplet_id)?;

        let key = notice.key();
        let window = self.config.flapping.window;
        let mut state = self.write();

        if let Some(record) = state.slots.get(&key) {
            let duplicate = matches!(record.last_exit_at, Some(at) if notice.timestamp <= at);
            let superseded =
                notice.timestamp < record.last_heartbeat && record.state.is_running();
            if duplicate || superseded {
                trace!(
                    droplet_id = %self.id,
                    instance = %key,
                    "Ignoring stale exit notice"
                );
                return Ok(ExitOutcome::Ignored);
            }
        }

        if notice.reason == ExitReason::Stopped {
            state.slots.remove(&key);
            debug!(droplet_id = %self.id, instance = %key, "Instance stopped");
            return Ok(ExitOutcome::Removed);
        }

        let sequence = state.next_sequence();
        let record = state.slots.entry(key.clone()).or_insert_with(|| {
            InstanceRecord::new(
                self.id.clone(),
                key.clone(),
                InstanceState::Down,
                notice.timestamp,
                sequence,
            )
        });

        record.last_exit_at = Some(notice.timestamp);
        if notice.timestamp > record.last_heartbeat {
            record.last_heartbeat = notice.timestamp;
            record.sequence = sequence;
        }

        let pending = if notice.reason.is_host_loss() {
            record.state = InstanceState::Down;
            PendingExit::HostLost { index: key.index }
        } else {
            let from = record.state;
            record.state = InstanceState::Crashed;
            apply_crash_bookkeeping(record, Some(from), notice.timestamp, window);
            PendingExit::Crashed { key: key.clone() }
        };
        state.pending_exits.push(pending);

        debug!(
            droplet_id = %self.id,
            instance = %key,
            reason = ?notice.reason,
            "Instance exited"
        );

        Ok(ExitOutcome::Queued)
    }

    /// Compare the slots against `desired` as of `now` and publish the
    /// resulting events on `bus`.
    ///
    /// Queued exits are always published. Missing and extra instances are
    /// only computed when a desired state is known and not stale. Events are
    /// raised in the order missing, extra, host-lost exits, crashes.
    pub fn analyze(
        self: &Arc<Self>,
        desired: Option<&DesiredState>,
        now: DateTime<Utc>,
        bus: &EventBus,
    ) -> AnalysisReport {
        let mut report = AnalysisReport::default();
        let exits = {
            let mut state = self.write();

            if let Some(desired) = desired.filter(|d| !d.stale) {
                let (missing, extra) = self.diff(&state, desired, now);
                report.missing = missing;
                report.extra = extra;
                state.desired = Some(desired.clone());
            }

            std::mem::take(&mut state.pending_exits)
        };

        if !report.missing.is_empty() {
            bus.notify(
                self,
                &DropletEvent::MissingInstances {
                    indices: report.missing.clone(),
                },
            );
        }

        if !report.extra.is_empty() {
            bus.notify(
                self,
                &DropletEvent::ExtraInstances {
                    instances: report.extra.clone(),
                },
            );
        }

        let (host_lost, crashed): (Vec<_>, Vec<_>) = exits
            .into_iter()
            .partition(|exit| matches!(exit, PendingExit::HostLost { .. }));

        for exit in host_lost {
            if let PendingExit::HostLost { index } = exit {
                report.exited_with_host.push(index);
                bus.notify(self, &DropletEvent::ExitDea { index });
            }
        }

        for exit in crashed {
            if let PendingExit::Crashed { key } = exit {
                bus.notify(
                    self,
                    &DropletEvent::ExitCrashed {
                        version: key.version.clone(),
                        index: key.index,
                    },
                );
                report.crashed.push(key);
            }
        }

        if report.event_count() > 0 {
            debug!(
                droplet_id = %self.id,
                missing = report.missing.len(),
                extra = report.extra.len(),
                exited = report.exited_with_host.len(),
                crashed = report.crashed.len(),
                "Comparison pass raised events"
            );
        }

        report
    }

    /// Raise `droplet_updated`: the desired state changed underneath us.
    pub fn notify_updated(self: &Arc<Self>, bus: &EventBus) {
        debug!(droplet_id = %self.id, "Droplet updated");
        bus.notify(self, &DropletEvent::DropletUpdated);
    }

    /// Current classification of the slot at `index`.
    ///
    /// Prefers the live version of the last known desired state; otherwise
    /// the most recently reported slot at that index.
    pub fn get_instance(&self, index: InstanceIndex) -> Option<InstanceRecord> {
        let state = self.read();

        if let Some(desired) = &state.desired {
            let key = InstanceKey::new(desired.live_version.clone(), index);
            if let Some(record) = state.slots.get(&key) {
                return Some(record.clone());
            }
        }

        state
            .slots
            .values()
            .filter(|r| r.index() == index)
            .max_by_key(|r| r.recency())
            .cloned()
    }

    /// Snapshot of a specific slot.
    pub fn instance(&self, key: &InstanceKey) -> Option<InstanceRecord> {
        self.read().slots.get(key).cloned()
    }

    /// Snapshot of every tracked slot, ordered by (version, index).
    pub fn instances(&self) -> Vec<InstanceRecord> {
        self.read().slots.values().cloned().collect()
    }

    /// Versions with at least one live instance.
    pub fn live_versions(&self, now: DateTime<Utc>) -> BTreeSet<Version> {
        let staleness = self.config.heartbeat_staleness;
        self.read()
            .slots
            .values()
            .filter(|r| r.is_live(staleness, now))
            .map(|r| r.version().clone())
            .collect()
    }

    /// Every slot whose instance may still be running on an agent.
    pub fn present_instances(&self, now: DateTime<Utc>) -> Vec<InstanceKey> {
        let staleness = self.config.heartbeat_staleness;
        self.read()
            .slots
            .values()
            .filter(|r| r.is_present(staleness, now))
            .map(|r| r.key.clone())
            .collect()
    }

    /// Drop slots with no report within the retention period. Returns how
    /// many were dropped.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = self.config.retention();
        let window = self.config.flapping.window;
        let mut state = self.write();
        let before = state.slots.len();

        state
            .slots
            .retain(|_, record| crate::crash::within(record.last_heartbeat, now, retention));
        for record in state.slots.values_mut() {
            record.crashes.trim(window, now);
        }

        let pruned = before - state.slots.len();
        if pruned > 0 {
            debug!(droplet_id = %self.id, pruned, "Pruned expired instance slots");
        }
        pruned
    }

    /// No slots are tracked.
    pub fn is_empty(&self) -> bool {
        self.read().slots.is_empty()
    }

    fn diff(
        &self,
        state: &DropletState,
        desired: &DesiredState,
        now: DateTime<Utc>,
    ) -> (Vec<InstanceIndex>, Vec<InstanceKey>) {
        let staleness = self.config.heartbeat_staleness;
        let live: Vec<&InstanceRecord> = state
            .slots
            .values()
            .filter(|r| r.is_live(staleness, now))
            .collect();

        let current: BTreeMap<InstanceIndex, &InstanceRecord> = live
            .iter()
            .filter(|r| r.version() == &desired.live_version)
            .map(|r| (r.index(), *r))
            .collect();

        let missing = desired
            .indices()
            .filter(|index| !current.contains_key(index))
            .collect();

        let extra = live
            .iter()
            .filter(|r| {
                if r.version() == &desired.live_version {
                    return !desired.wants_index(r.index());
                }
                // An old version's slot is replaced, not extra, once the live
                // version has reported at that index since.
                let replaced = current
                    .get(&r.index())
                    .is_some_and(|cur| cur.recency() >= r.recency());
                !replaced
            })
            .map(|r| r.key.clone())
            .collect();

        (missing, extra)
    }

    fn check_droplet(&self, reported: &DropletId) -> DropletResult<()> {
        if reported != &self.id {
            return Err(DropletError::DropletMismatch {
                expected: self.id.clone(),
                got: reported.clone(),
            });
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, DropletState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DropletState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A crash counts once, when the slot enters CRASHED. Further reports of the
/// same crashed slot, by heartbeat or exit notice, only refresh it.
fn apply_crash_bookkeeping(
    record: &mut InstanceRecord,
    from: Option<InstanceState>,
    at: DateTime<Utc>,
    window: std::time::Duration,
) {
    let state = record.state;
    if state.is_crash() {
        if !from.is_some_and(|from| from.is_crash()) {
            record.crashes.record_crash(at);
        }
    } else if state.is_running() {
        record.crashes.note_running(at, window);
    }
}
