//! End-to-end reconciliation: agent reports in, commands out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use hm_droplet::EventBus;
use hm_harmonizer::collaborators::{
    ChannelDispatcher, InMemoryDesiredState, ManualScheduler, NudgeCommand, RecordingDispatcher,
    StopReason, StopTarget, TokioScheduler,
};
use hm_harmonizer::{Harmonizer, HarmonizerConfig};
use hm_types::{
    DesiredState, DropletId, ExitNotice, ExitReason, Heartbeat, InstanceKey, InstanceState,
    Priority,
};

struct Controller {
    harmonizer: Arc<Harmonizer>,
    dispatcher: Arc<RecordingDispatcher>,
    scheduler: Arc<ManualScheduler>,
    desired: Arc<InMemoryDesiredState>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn controller() -> Controller {
    init_tracing();
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

    Controller {
        harmonizer,
        dispatcher,
        scheduler,
        desired,
    }
}

fn app() -> DropletId {
    DropletId::new("app-id")
}

#[test]
fn test_version_rollover_is_neither_missing_nor_extra() {
    let c = controller();
    let now = Utc::now();
    c.desired.set(app(), DesiredState::new(1, "version-2"));

    c.harmonizer.process_batch(
        &[Heartbeat::new("app-id", "version-1", 0, InstanceState::Running, now)],
        now,
    );
    c.harmonizer.process_batch(
        &[Heartbeat::new("app-id", "version-2", 0, InstanceState::Running, now)],
        now,
    );
    let report = c.harmonizer.on_desired_state_refreshed(&app(), now).unwrap();

    assert!(report.missing.is_empty());
    assert!(report.extra.is_empty());
    assert!(c.dispatcher.commands().is_empty());
}

#[test]
fn test_scale_down_stops_surplus_in_one_batch() {
    let c = controller();
    let now = Utc::now();
    c.desired.set(app(), DesiredState::new(1, "v1"));

    let batch: Vec<_> = (0..3)
        .map(|i| Heartbeat::new("app-id", "v1", i, InstanceState::Running, now))
        .collect();
    c.harmonizer.process_batch(&batch, now);
    c.harmonizer.on_desired_state_refreshed(&app(), now).unwrap();

    assert_eq!(
        c.dispatcher.stops(),
        vec![(
            app(),
            vec![
                StopTarget::new(InstanceKey::new("v1", 1), StopReason::ExtraInstance),
                StopTarget::new(InstanceKey::new("v1", 2), StopReason::ExtraInstance),
            ]
        )]
    );
    assert!(c.dispatcher.starts().is_empty());
}

#[test]
fn test_crash_loop_backs_off_and_desired_change_cancels() {
    let c = controller();
    let start = Utc::now();
    c.desired.set(app(), DesiredState::new(1, "v1"));

    c.harmonizer.process_batch(
        &[Heartbeat::new("app-id", "v1", 0, InstanceState::Running, start)],
        start,
    );
    c.harmonizer.on_desired_state_refreshed(&app(), start).unwrap();

    // Three crashes in quick succession, each followed by a restart.
    for n in 1..=3 {
        let at = start + ChronoDuration::seconds(n * 10);
        c.harmonizer
            .process_exit(
                &ExitNotice::new("app-id", "v1", 0, ExitReason::Crashed, at),
                at,
            )
            .unwrap();
        let back = at + ChronoDuration::seconds(1);
        c.harmonizer.process_batch(
            &[Heartbeat::new("app-id", "v1", 0, InstanceState::Running, back)],
            back,
        );
    }

    // Crashes one and two restart at low priority; the third reaches the
    // flapping threshold and is restarted at once as a first offense.
    assert_eq!(c.dispatcher.starts(), vec![(app(), 0, Priority::Low); 3]);
    assert_eq!(c.scheduler.pending(), 0);

    // The fourth crash is delayed.
    let at = start + ChronoDuration::seconds(40);
    c.harmonizer
        .process_exit(
            &ExitNotice::new("app-id", "v1", 0, ExitReason::Crashed, at),
            at,
        )
        .unwrap();
    assert_eq!(c.dispatcher.starts().len(), 3);
    assert_eq!(c.scheduler.pending_delays(), vec![Duration::from_secs(120)]);

    // A desired-state change drops the pending restart.
    c.harmonizer.on_droplet_updated(&app());
    c.scheduler.advance(Duration::from_secs(120));
    assert_eq!(c.dispatcher.starts().len(), 3);
    assert_eq!(c.desired.update_requests().last(), Some(&app()));
}

#[test]
fn test_agent_loss_restarts_crash_looping_instance_high() {
    let c = controller();
    let start = Utc::now();
    c.desired.set(app(), DesiredState::new(1, "v1"));

    c.harmonizer.process_batch(
        &[Heartbeat::new("app-id", "v1", 0, InstanceState::Running, start)],
        start,
    );
    c.harmonizer.on_desired_state_refreshed(&app(), start).unwrap();

    for n in 1..=4 {
        let at = start + ChronoDuration::seconds(n * 10);
        c.harmonizer
            .process_exit(
                &ExitNotice::new("app-id", "v1", 0, ExitReason::Crashed, at),
                at,
            )
            .unwrap();
        let back = at + ChronoDuration::seconds(1);
        c.harmonizer.process_batch(
            &[Heartbeat::new("app-id", "v1", 0, InstanceState::Running, back)],
            back,
        );
    }
    // The fourth crash left a delayed restart behind.
    assert_eq!(c.scheduler.pending(), 1);
    c.dispatcher.clear();

    // The agent goes away while the instance is past the flapping threshold.
    let at = start + ChronoDuration::seconds(50);
    c.harmonizer
        .process_exit(
            &ExitNotice::new("app-id", "v1", 0, ExitReason::DeaShutdown, at),
            at,
        )
        .unwrap();

    assert_eq!(c.dispatcher.starts(), vec![(app(), 0, Priority::High)]);
    assert_eq!(c.scheduler.pending(), 1);
}

#[test]
fn test_removed_app_is_stopped_once_per_sweep() {
    let c = controller();
    let now = Utc::now();

    c.harmonizer.process_batch(
        &[
            Heartbeat::new("app-id", "version-1", 0, InstanceState::Running, now),
            Heartbeat::new("app-id", "version-2", 0, InstanceState::Running, now),
        ],
        now,
    );

    c.harmonizer.sweep(now);

    let stops = c.dispatcher.stops();
    assert_eq!(stops.len(), 1);
    assert!(stops[0]
        .1
        .iter()
        .all(|target| target.reason == StopReason::ExtraApp));
    assert_eq!(stops[0].1.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_restart_fires_on_tokio_runtime() {
    let (dispatcher, mut commands) = ChannelDispatcher::channel();
    let desired = Arc::new(InMemoryDesiredState::new());
    desired.set(app(), DesiredState::new(1, "v1"));

    let harmonizer = Arc::new(Harmonizer::new(
        HarmonizerConfig::default(),
        Arc::new(EventBus::new()),
        desired,
        Arc::new(dispatcher),
        Arc::new(TokioScheduler::current().unwrap()),
    ));
    harmonizer.prepare();

    let now = Utc::now();
    harmonizer.process_batch(
        &[Heartbeat::new("app-id", "v1", 0, InstanceState::Flapping, now)],
        now,
    );
    harmonizer.on_desired_state_refreshed(&app(), now).unwrap();

    // Flapping and missing: nothing yet.
    assert!(commands.try_recv().is_err());
    assert_eq!(harmonizer.delayed_restarts().len(), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(
        commands.recv().await,
        Some(NudgeCommand::Start {
            droplet_id: app(),
            index: 0,
            priority: Priority::Low,
        })
    );
    assert!(harmonizer.delayed_restarts().is_empty());
}
