//! Daemon wiring and the main loop

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hm_droplet::EventBus;
use hm_harmonizer::collaborators::{Dispatcher, InMemoryDesiredState, TokioScheduler};
use hm_harmonizer::{Harmonizer, SweepReport};
use hm_types::DropletId;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::error::DaemonResult;
use crate::source::{self, DesiredStateSource};
use crate::wire::{decode_line, AgentMessage};

/// Droplets whose desired state the harmonizer asked to refresh
pub type RefreshRequests = mpsc::UnboundedReceiver<DropletId>;

/// Counters for one run of the main loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub messages: usize,
    pub malformed: usize,
    pub sweeps: usize,
    pub refreshes: usize,
}

/// Health manager daemon: feeds agent messages into the harmonizer and keeps
/// desired state loaded.
pub struct Daemon {
    config: DaemonConfig,
    harmonizer: Arc<Harmonizer>,
    desired: Arc<InMemoryDesiredState>,
    source: Box<dyn DesiredStateSource>,
}

impl Daemon {
    /// Build the daemon. Must be called from within a tokio runtime.
    pub fn new(
        config: DaemonConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> DaemonResult<(Self, RefreshRequests)> {
        let source = source::from_config(&config.desired_state);
        Self::with_source(config, dispatcher, source)
    }

    /// Build the daemon with an explicit desired state source
    pub fn with_source(
        config: DaemonConfig,
        dispatcher: Arc<dyn Dispatcher>,
        source: Box<dyn DesiredStateSource>,
    ) -> DaemonResult<(Self, RefreshRequests)> {
        let (desired, refresh_rx) = InMemoryDesiredState::with_refresh_channel();
        let desired = Arc::new(desired);
        let scheduler = Arc::new(TokioScheduler::current()?);

        let harmonizer = Arc::new(Harmonizer::new(
            config.harmonizer_config(),
            Arc::new(EventBus::new()),
            desired.clone(),
            dispatcher,
            scheduler,
        ));
        harmonizer.prepare();

        let daemon = Self {
            config,
            harmonizer,
            desired,
            source,
        };
        Ok((daemon, refresh_rx))
    }

    pub fn harmonizer(&self) -> &Arc<Harmonizer> {
        &self.harmonizer
    }

    /// Reload the whole desired state from its source. On failure the store
    /// is marked unavailable, which suspends stops and sweeps.
    pub async fn reload_desired_state(&self) -> bool {
        match self.source.load().await {
            Ok(snapshot) => {
                debug!(droplets = snapshot.len(), "Desired state loaded");
                self.desired.replace_all(snapshot);
                self.desired.set_available(true);
                true
            }
            Err(e) => {
                warn!(error = %e, "Desired state unavailable");
                self.desired.set_available(false);
                false
            }
        }
    }

    /// Apply one agent message
    pub fn handle_message(&self, message: AgentMessage, now: DateTime<Utc>) {
        match message {
            AgentMessage::Heartbeat { droplets } => {
                let report = self.harmonizer.process_batch(&droplets, now);
                debug!(
                    received = report.received,
                    changed = report.changed,
                    analyzed = report.analyzed,
                    "Heartbeats processed"
                );
            }
            AgentMessage::Exit(notice) => {
                if let Err(e) = self.harmonizer.process_exit(&notice, now) {
                    warn!(droplet_id = %notice.droplet_id, error = %e, "Exit notice rejected");
                }
            }
            AgentMessage::DropletUpdated { droplet_id } => {
                self.harmonizer.on_droplet_updated(&droplet_id);
            }
        }
    }

    /// Decode and apply one line of the agent feed. Returns whether the line
    /// was well formed.
    pub fn handle_line(&self, line: &str, now: DateTime<Utc>) -> bool {
        match decode_line(line) {
            Ok(Some(message)) => {
                self.handle_message(message, now);
                true
            }
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "Malformed agent message");
                false
            }
        }
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let report = self.harmonizer.sweep(now);
        if report.extra_apps > 0 || report.forgotten > 0 {
            info!(
                compared = report.compared,
                extra_apps = report.extra_apps,
                forgotten = report.forgotten,
                "Sweep stopped removed droplets"
            );
        }
        report
    }

    /// Serve refresh requests: reload once for everything queued, then let
    /// each droplet compare against the fresh data. Returns how many
    /// droplets were refreshed.
    pub async fn process_refresh_requests(
        &self,
        first: DropletId,
        requests: &mut RefreshRequests,
    ) -> usize {
        let mut pending = BTreeSet::from([first]);
        while let Ok(droplet_id) = requests.try_recv() {
            pending.insert(droplet_id);
        }

        if !self.reload_desired_state().await {
            // Droplets stay flagged; the next sweep asks again.
            return 0;
        }

        let now = Utc::now();
        let mut refreshed = 0;
        for droplet_id in pending {
            match self.harmonizer.on_desired_state_refreshed(&droplet_id, now) {
                Ok(report) => {
                    debug!(droplet_id = %droplet_id, events = report.event_count(), "Droplet refreshed");
                    refreshed += 1;
                }
                Err(e) => warn!(droplet_id = %droplet_id, error = %e, "Refresh failed"),
            }
        }
        refreshed
    }

    /// Run until the agent feed closes or `shutdown` completes
    pub async fn run<R, F>(
        &self,
        mut requests: RefreshRequests,
        input: R,
        shutdown: F,
    ) -> DaemonResult<RunSummary>
    where
        R: AsyncBufRead + Unpin,
        F: Future<Output = ()>,
    {
        let mut summary = RunSummary::default();
        let mut lines = input.lines();

        // The first sweep and reload come one period after startup.
        let sweep_period = Duration::from_secs(self.config.scheduler.sweep_interval_secs);
        let mut sweep_interval = interval_at(Instant::now() + sweep_period, sweep_period);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let reload_period = Duration::from_secs(self.config.scheduler.desired_state_refresh_secs);
        let mut reload_interval = interval_at(Instant::now() + reload_period, reload_period);
        reload_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.reload_desired_state().await;
        info!("Health manager started");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                Some(droplet_id) = requests.recv() => {
                    summary.refreshes += self.process_refresh_requests(droplet_id, &mut requests).await;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        summary.messages += 1;
                        if !self.handle_line(&line, Utc::now()) {
                            summary.malformed += 1;
                        }
                    }
                    Ok(None) => {
                        info!("Agent feed closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Agent feed failed");
                        return Err(e.into());
                    }
                },
                _ = reload_interval.tick() => {
                    self.reload_desired_state().await;
                }
                _ = sweep_interval.tick() => {
                    self.sweep(Utc::now());
                    summary.sweeps += 1;
                }
            }
        }

        info!(
            messages = summary.messages,
            sweeps = summary.sweeps,
            "Health manager stopped"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaemonError;
    use crate::source::DesiredSnapshot;
    use async_trait::async_trait;
    use hm_harmonizer::collaborators::{RecordingDispatcher, StopReason, StopTarget};
    use hm_types::{DesiredState, InstanceKey, Priority};
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::sync::oneshot;

    fn app() -> DropletId {
        DropletId::new("app")
    }

    fn config_with_app(instances: u32) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config
            .desired_state
            .droplets
            .insert(app(), DesiredState::new(instances, "v1"));
        config
    }

    fn heartbeat_line(indices: &[u32], now: DateTime<Utc>) -> String {
        let droplets: Vec<String> = indices
            .iter()
            .map(|i| {
                format!(
                    r#"{{"droplet_id":"app","version":"v1","index":{},"state":"RUNNING","timestamp":"{}"}}"#,
                    i,
                    now.to_rfc3339()
                )
            })
            .collect();
        format!(r#"{{"type":"heartbeat","droplets":[{}]}}"#, droplets.join(","))
    }

    struct BrokenSource;

    #[async_trait]
    impl DesiredStateSource for BrokenSource {
        async fn load(&self) -> DaemonResult<DesiredSnapshot> {
            Err(DaemonError::DesiredState("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_heartbeat_then_refresh_stops_extra() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let (daemon, mut requests) = Daemon::new(config_with_app(1), dispatcher.clone()).unwrap();
        assert!(daemon.reload_desired_state().await);

        let now = Utc::now();
        assert!(daemon.handle_line(&heartbeat_line(&[0, 1], now), now));

        // A new droplet awaits its desired state before anything is stopped.
        assert!(dispatcher.commands().is_empty());
        let first = requests.try_recv().unwrap();

        assert_eq!(daemon.process_refresh_requests(first, &mut requests).await, 1);
        assert_eq!(
            dispatcher.stops(),
            vec![(
                app(),
                vec![StopTarget::new(
                    InstanceKey::new("v1", 1),
                    StopReason::ExtraInstance
                )]
            )]
        );
        assert!(dispatcher.starts().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_starts_unreported_droplet() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let (daemon, mut requests) = Daemon::new(config_with_app(2), dispatcher.clone()).unwrap();
        daemon.reload_desired_state().await;

        let report = daemon.sweep(Utc::now());
        assert_eq!(report.refresh_requested, 1);

        let first = requests.try_recv().unwrap();
        daemon.process_refresh_requests(first, &mut requests).await;
        assert_eq!(
            dispatcher.starts(),
            vec![(app(), 0, Priority::Normal), (app(), 1, Priority::Normal)]
        );
    }

    #[tokio::test]
    async fn test_unavailable_source_suspends_sweeps() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let (daemon, mut requests) = Daemon::with_source(
            DaemonConfig::default(),
            dispatcher.clone(),
            Box::new(BrokenSource),
        )
        .unwrap();

        assert!(!daemon.reload_desired_state().await);

        let now = Utc::now();
        daemon.handle_line(&heartbeat_line(&[0], now), now);
        assert!(daemon.sweep(now).skipped);

        let first = requests.try_recv().unwrap();
        assert_eq!(daemon.process_refresh_requests(first, &mut requests).await, 0);
        assert!(dispatcher.commands().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let (daemon, _requests) =
            Daemon::new(config_with_app(1), Arc::new(RecordingDispatcher::new())).unwrap();

        assert!(!daemon.handle_line("{\"type\":\"bogus\"}", Utc::now()));
        assert!(daemon.handle_line("", Utc::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reconciles_agent_feed() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let (daemon, requests) = Daemon::new(config_with_app(1), dispatcher.clone()).unwrap();

        let (mut agent, feed) = tokio::io::duplex(4096);
        let now = Utc::now();
        agent
            .write_all(format!("{}\nnot json\n", heartbeat_line(&[0, 1], now)).as_bytes())
            .await
            .unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            daemon
                .run(requests, BufReader::new(feed), async {
                    let _ = stop_rx.await;
                })
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        stop_tx.send(()).unwrap();
        let summary = task.await.unwrap().unwrap();

        assert_eq!(summary.messages, 2);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.refreshes, 1);
        assert_eq!(
            dispatcher.stops(),
            vec![(
                app(),
                vec![StopTarget::new(
                    InstanceKey::new("v1", 1),
                    StopReason::ExtraInstance
                )]
            )]
        );
        assert!(dispatcher.starts().is_empty());
        drop(agent);
    }

    #[tokio::test]
    async fn test_run_ends_when_feed_closes() {
        let (daemon, requests) =
            Daemon::new(config_with_app(1), Arc::new(RecordingDispatcher::new())).unwrap();

        let summary = daemon
            .run(requests, &b""[..], std::future::pending())
            .await
            .unwrap();
        assert_eq!(summary.messages, 0);
    }
}
