//! Periodic fleet sweep and the desired-state refresh loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hm_droplet::{AnalysisReport, Droplet};
use hm_types::DropletId;
use tracing::{debug, info, instrument, warn};

use crate::collaborators::{StopReason, StopTarget};
use crate::error::{HarmonizerError, HarmonizerResult};
use crate::harmonizer::Harmonizer;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Desired state was unavailable; nothing was compared or stopped.
    pub skipped: bool,
    /// Droplets compared against their desired state.
    pub compared: usize,
    /// Droplets whose desired state was asked to refresh.
    pub refresh_requested: usize,
    /// Droplets no longer in desired state whose instances were stopped.
    pub extra_apps: usize,
    /// Droplets dropped from the registry.
    pub forgotten: usize,
    /// Expired instance records dropped.
    pub pruned: usize,
}

enum SweepStep {
    Done,
    Refresh,
}

impl Harmonizer {
    /// Compare the whole fleet against desired state.
    ///
    /// Droplets gone from desired state are stopped as extra apps and
    /// forgotten once nothing of them is left running. Droplets awaiting a
    /// desired-state refresh get one requested; all others are compared.
    #[instrument(skip(self))]
    pub fn sweep(self: &Arc<Self>, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        if !self.desired_state.is_available() {
            warn!("Desired state unavailable, skipping sweep");
            report.skipped = true;
            return report;
        }

        // Desired droplets nobody reported yet still need their instances.
        for droplet_id in self.desired_state.droplet_ids() {
            self.droplets.get_or_create(&droplet_id);
        }

        for droplet in self.droplets.all() {
            match self.sweep_droplet(&droplet, now, &mut report) {
                SweepStep::Done => {}
                SweepStep::Refresh => {
                    report.refresh_requested += 1;
                    if let Err(e) = self.update_desired_state(droplet.id()) {
                        warn!(droplet_id = %droplet.id(), error = %e, "Desired state refresh failed");
                    }
                }
            }
        }

        info!(
            compared = report.compared,
            refresh_requested = report.refresh_requested,
            extra_apps = report.extra_apps,
            forgotten = report.forgotten,
            pruned = report.pruned,
            "Sweep complete"
        );
        report
    }

    fn sweep_droplet(
        self: &Arc<Self>,
        droplet: &Arc<Droplet>,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> SweepStep {
        let _pass = droplet.begin_pass();

        if self.config.prune_expired_instances {
            report.pruned += droplet.prune_expired(now);
        }

        let Some(desired) = self.desired_state.get(droplet.id()) else {
            match self.on_extra_app(droplet, now) {
                Ok(0) => {}
                Ok(_) => report.extra_apps += 1,
                Err(e) => {
                    warn!(droplet_id = %droplet.id(), error = %e, "Stopping extra app failed")
                }
            }

            if droplet.present_instances(now).is_empty() {
                self.abort_all_pending_delayed_restarts(droplet.id());
                self.droplets.remove(droplet.id());
                report.forgotten += 1;
            }
            return SweepStep::Done;
        };

        if droplet.desired_state_update_required() {
            return SweepStep::Refresh;
        }

        droplet.analyze(Some(&desired), now, &self.bus);
        report.compared += 1;
        SweepStep::Done
    }

    /// Stop every instance of a droplet that is no longer wanted at all, in
    /// one batch labelled "Extra app". Returns how many were stopped.
    ///
    /// Nothing is stopped while desired state is unavailable.
    #[instrument(skip(self, droplet), fields(droplet_id = %droplet.id()))]
    pub fn on_extra_app(&self, droplet: &Droplet, now: DateTime<Utc>) -> HarmonizerResult<usize> {
        if !self.desired_state.is_available() {
            debug!("Desired state unavailable, not stopping extra app");
            return Ok(0);
        }

        let targets: Vec<StopTarget> = droplet
            .present_instances(now)
            .into_iter()
            .map(|key| StopTarget::new(key, StopReason::ExtraApp))
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let count = targets.len();
        info!(count, "Stopping extra app");
        self.dispatcher
            .stop_instances_immediately(droplet.id(), targets)?;
        Ok(count)
    }

    /// The provider refreshed a droplet's desired state: drop its pending
    /// delayed restarts, clear its flag and compare it right away.
    #[instrument(skip(self))]
    pub fn on_desired_state_refreshed(
        self: &Arc<Self>,
        droplet_id: &DropletId,
        now: DateTime<Utc>,
    ) -> HarmonizerResult<AnalysisReport> {
        if !self.desired_state.is_available() {
            return Err(HarmonizerError::DesiredStateUnavailable);
        }

        let droplet = self.droplets.require(droplet_id)?;
        let _pass = droplet.begin_pass();

        // The fresh comparison reschedules whatever is still missing.
        let cancelled = self.abort_all_pending_delayed_restarts(droplet_id);
        if cancelled > 0 {
            debug!(cancelled, "Dropped delayed restarts superseded by refresh");
        }

        droplet.set_desired_state_update_required(false);
        let desired = self.desired_state.get(droplet_id);
        Ok(droplet.analyze(desired.as_ref(), now, &self.bus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryDesiredState, ManualScheduler, RecordingDispatcher};
    use crate::config::HarmonizerConfig;
    use chrono::Duration as ChronoDuration;
    use hm_droplet::{DropletEvent, EventBus};
    use hm_types::{DesiredState, Heartbeat, InstanceKey, InstanceState, Priority};
    use std::time::Duration;

    struct Fixture {
        harmonizer: Arc<Harmonizer>,
        dispatcher: Arc<RecordingDispatcher>,
        scheduler: Arc<ManualScheduler>,
        desired: Arc<InMemoryDesiredState>,
    }

    fn fixture() -> Fixture {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let scheduler = Arc::new(ManualScheduler::new());
        let desired = Arc::new(InMemoryDesiredState::new());
        let harmonizer = Arc::new(Harmonizer::new(
            HarmonizerConfig::default(),
            Arc::new(EventBus::new()),
            desired.clone(),
            dispatcher.clone(),
            scheduler.clone(),
        ));
        harmonizer.prepare();
        Fixture {
            harmonizer,
            dispatcher,
            scheduler,
            desired,
        }
    }

    /// version-1 and version-2 both reported at index 0.
    fn upgraded_app(f: &Fixture) -> Arc<Droplet> {
        let droplet = f.harmonizer.droplets().get_or_create(&DropletId::new("app-id"));
        let now = Utc::now();
        for version in ["version-1", "version-2"] {
            droplet
                .process_heartbeat(&Heartbeat::new(
                    "app-id",
                    version,
                    0,
                    InstanceState::Running,
                    now,
                ))
                .unwrap();
        }
        droplet
    }

    #[test]
    fn test_extra_app_stops_every_instance() {
        let f = fixture();
        let app = upgraded_app(&f);

        let stopped = f.harmonizer.on_extra_app(&app, Utc::now()).unwrap();

        assert_eq!(stopped, 2);
        assert_eq!(
            f.dispatcher.stops(),
            vec![(
                DropletId::new("app-id"),
                vec![
                    StopTarget::new(InstanceKey::new("version-1", 0), StopReason::ExtraApp),
                    StopTarget::new(InstanceKey::new("version-2", 0), StopReason::ExtraApp),
                ]
            )]
        );
    }

    #[test]
    fn test_extra_app_without_desired_state_stops_nothing() {
        let f = fixture();
        let app = upgraded_app(&f);
        f.desired.set_available(false);

        assert_eq!(f.harmonizer.on_extra_app(&app, Utc::now()).unwrap(), 0);
        assert!(f.dispatcher.commands().is_empty());
    }

    #[test]
    fn test_sweep_skipped_without_desired_state() {
        let f = fixture();
        upgraded_app(&f);
        f.desired.set_available(false);

        let report = f.harmonizer.sweep(Utc::now());

        assert!(report.skipped);
        assert!(f.dispatcher.commands().is_empty());
    }

    #[test]
    fn test_sweep_stops_then_forgets_extra_app() {
        let f = fixture();
        upgraded_app(&f);
        let now = Utc::now();

        let report = f.harmonizer.sweep(now);
        assert_eq!(report.extra_apps, 1);
        assert_eq!(report.forgotten, 0);
        assert_eq!(f.dispatcher.stops().len(), 1);

        // Once the instances stopped reporting the droplet is dropped.
        let later = now + ChronoDuration::seconds(600);
        let report = f.harmonizer.sweep(later);
        assert_eq!(report.forgotten, 1);
        assert!(f.harmonizer.droplets().is_empty());
        assert_eq!(f.dispatcher.stops().len(), 1);
    }

    #[test]
    fn test_sweep_requests_refresh_then_compares() {
        let f = fixture();
        let app = DropletId::new("app-id");
        f.desired.set(app.clone(), DesiredState::new(2, "v1"));
        let now = Utc::now();

        // A droplet nobody reported yet is tracked and refreshed first.
        let report = f.harmonizer.sweep(now);
        assert_eq!(report.refresh_requested, 1);
        assert_eq!(f.desired.update_requests(), vec![app.clone()]);
        assert!(f.dispatcher.commands().is_empty());

        let analysis = f.harmonizer.on_desired_state_refreshed(&app, now).unwrap();
        assert_eq!(analysis.missing, vec![0, 1]);
        assert_eq!(
            f.dispatcher.starts(),
            vec![
                (app.clone(), 0, Priority::Normal),
                (app.clone(), 1, Priority::Normal)
            ]
        );

        // Subsequent sweeps compare directly; the level-triggered pass
        // re-detects what is still missing.
        f.dispatcher.clear();
        let report = f.harmonizer.sweep(now);
        assert_eq!(report.compared, 1);
        assert_eq!(f.dispatcher.starts().len(), 2);
    }

    /// A FLAPPING instance at v1/0 with a delayed restart pending.
    fn delayed_restart_pending(f: &Fixture) -> Arc<Droplet> {
        let app = DropletId::new("app-id");
        f.desired.set(app.clone(), DesiredState::new(1, "v1"));
        let droplet = f.harmonizer.droplets().get_or_create(&app);
        droplet
            .process_heartbeat(&Heartbeat::new(
                "app-id",
                "v1",
                0,
                InstanceState::Flapping,
                Utc::now(),
            ))
            .unwrap();
        droplet.set_desired_state_update_required(false);

        f.harmonizer
            .bus()
            .notify(&droplet, &DropletEvent::MissingInstances { indices: vec![0] });
        assert_eq!(f.harmonizer.delayed_restarts().len(), 1);
        droplet
    }

    #[test]
    fn test_refresh_cancels_superseded_delayed_restarts() {
        let f = fixture();
        delayed_restart_pending(&f);
        let app = DropletId::new("app-id");

        f.desired.set(app.clone(), DesiredState::new(0, "v1"));
        f.harmonizer.on_desired_state_refreshed(&app, Utc::now()).unwrap();
        assert!(f.harmonizer.delayed_restarts().is_empty());

        f.scheduler.advance(Duration::from_secs(60));
        assert!(f.dispatcher.starts().is_empty());
    }

    #[test]
    fn test_delayed_restart_skips_index_no_longer_wanted() {
        let f = fixture();
        delayed_restart_pending(&f);

        // Scaled down before anyone compared the droplet again.
        f.desired
            .set(DropletId::new("app-id"), DesiredState::new(0, "v1"));
        f.scheduler.advance(Duration::from_secs(60));

        assert!(f.dispatcher.starts().is_empty());
        assert!(f.harmonizer.delayed_restarts().is_empty());
    }

    #[test]
    fn test_refreshed_unknown_droplet() {
        let f = fixture();
        assert!(matches!(
            f.harmonizer
                .on_desired_state_refreshed(&DropletId::new("ghost"), Utc::now()),
            Err(HarmonizerError::Droplet(_))
        ));

        f.desired.set_available(false);
        assert!(matches!(
            f.harmonizer
                .on_desired_state_refreshed(&DropletId::new("ghost"), Utc::now()),
            Err(HarmonizerError::DesiredStateUnavailable)
        ));
    }
}
