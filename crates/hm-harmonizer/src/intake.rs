//! Intake of agent reports.
//!
//! A heartbeat batch only triggers a comparison pass for droplets whose
//! slots actually changed, so replaying a batch raises nothing. Droplets that
//! did not change are still compared by the periodic sweep.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hm_droplet::{ExitOutcome, HeartbeatOutcome};
use hm_types::{DropletId, ExitNotice, Heartbeat};
use tracing::{debug, instrument, warn};

use crate::error::HarmonizerResult;
use crate::harmonizer::Harmonizer;

/// What ingesting one heartbeat batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    /// Heartbeats that created a slot or changed its state.
    pub changed: usize,
    /// Heartbeats that only refreshed a slot.
    pub refreshed: usize,
    /// Duplicate or out-of-order heartbeats.
    pub ignored: usize,
    /// Droplets a comparison pass ran for.
    pub analyzed: usize,
}

impl Harmonizer {
    /// Fold a batch of heartbeats into their droplets.
    #[instrument(skip(self, heartbeats), fields(received = heartbeats.len()))]
    pub fn process_batch(
        self: &Arc<Self>,
        heartbeats: &[Heartbeat],
        now: DateTime<Utc>,
    ) -> BatchReport {
        let mut report = BatchReport {
            received: heartbeats.len(),
            ..Default::default()
        };

        let mut by_droplet: BTreeMap<&DropletId, Vec<&Heartbeat>> = BTreeMap::new();
        for heartbeat in heartbeats {
            by_droplet
                .entry(&heartbeat.droplet_id)
                .or_default()
                .push(heartbeat);
        }

        for (droplet_id, heartbeats) in by_droplet {
            let droplet = self.droplets.get_or_create(droplet_id);

            let changed = {
                let _pass = droplet.begin_pass();
                let mut changed = false;

                for heartbeat in heartbeats {
                    match droplet.process_heartbeat(heartbeat) {
                        Ok(HeartbeatOutcome::Ignored) => report.ignored += 1,
                        Ok(HeartbeatOutcome::Refreshed) => report.refreshed += 1,
                        Ok(_) => {
                            report.changed += 1;
                            changed = true;
                        }
                        Err(e) => warn!(error = %e, "Rejected heartbeat"),
                    }
                }

                if changed {
                    let desired = if self.desired_state.is_available() {
                        self.desired_state.get(droplet_id)
                    } else {
                        None
                    };
                    droplet.analyze(desired.as_ref(), now, &self.bus);
                    report.analyzed += 1;
                }
                changed
            };

            if changed && droplet.desired_state_update_required() {
                if let Err(e) = self.update_desired_state(droplet_id) {
                    warn!(droplet_id = %droplet_id, error = %e, "Desired state refresh failed");
                }
            }
        }

        debug!(
            changed = report.changed,
            ignored = report.ignored,
            analyzed = report.analyzed,
            "Heartbeat batch processed"
        );
        report
    }

    /// Fold one exit notice into its droplet and raise the exit event.
    #[instrument(skip(self, notice), fields(droplet_id = %notice.droplet_id, index = notice.index))]
    pub fn process_exit(
        self: &Arc<Self>,
        notice: &ExitNotice,
        now: DateTime<Utc>,
    ) -> HarmonizerResult<ExitOutcome> {
        let droplet = self.droplets.get_or_create(&notice.droplet_id);
        let _pass = droplet.begin_pass();

        let outcome = droplet.process_exit(notice)?;
        if outcome == ExitOutcome::Queued {
            // Exits only; missing and extra instances are left to the
            // heartbeat and sweep passes.
            droplet.analyze(None, now, &self.bus);
        }
        Ok(outcome)
    }

    /// The droplet's desired state changed at its source.
    #[instrument(skip(self))]
    pub fn on_droplet_updated(self: &Arc<Self>, droplet_id: &DropletId) {
        let droplet = self.droplets.get_or_create(droplet_id);
        droplet.notify_updated(&self.bus);
    }
}
