//! Harmonizer: reacts to droplet events with corrective commands.
//!
//! The harmonizer subscribes to the controller's [`EventBus`] and maps every
//! droplet event to a dispatcher call:
//!
//! | Event | Condition | Action |
//! |---|---|---|
//! | missing instances | flapping | flapping policy, delayed |
//! | missing instances | otherwise | start, normal priority |
//! | extra instances | | one batched stop |
//! | exit with agent | | start, high priority |
//! | crash exit | flapping | flapping policy, immediate |
//! | crash exit | otherwise | start, low priority |
//! | droplet updated | | cancel restarts, refresh desired state, flag droplet |
//!
//! Missing and extra instances are ignored while the droplet awaits a
//! desired-state refresh.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use hm_droplet::{
    Droplet, DropletEvent, DropletListener, DropletRegistry, EventBus, FlappingDetector,
    InstanceRecord, ListenerId, ListenerResult,
};
use hm_types::{DropletId, InstanceIndex, InstanceKey, Priority, Version};
use tracing::{debug, info, instrument, warn};

use crate::collaborators::{DesiredStateProvider, Dispatcher, Scheduler, StopReason, StopTarget};
use crate::config::HarmonizerConfig;
use crate::delayed::{DelayedRestarts, RestartTicket};
use crate::error::HarmonizerResult;

/// Registration id of the harmonizer on the bus.
const LISTENER_ID: &str = "harmonizer";

/// What the flapping policy decided for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlappingAction {
    /// Restarted without delay.
    RestartedNow,
    /// Restart scheduled after the given delay.
    Scheduled(Duration),
    /// A restart was already pending for the slot.
    AlreadyPending,
    /// Crashed too often; left down.
    GaveUp,
}

/// Reconciliation policy for every droplet of one controller.
pub struct Harmonizer {
    pub(crate) config: HarmonizerConfig,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) droplets: DropletRegistry,
    pub(crate) desired_state: Arc<dyn DesiredStateProvider>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    scheduler: Arc<dyn Scheduler>,
    flapping: FlappingDetector,
    pub(crate) delayed_restarts: DelayedRestarts,
}

impl Harmonizer {
    pub fn new(
        config: HarmonizerConfig,
        bus: Arc<EventBus>,
        desired_state: Arc<dyn DesiredStateProvider>,
        dispatcher: Arc<dyn Dispatcher>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            droplets: DropletRegistry::new(config.droplet.clone()),
            flapping: FlappingDetector::new(config.droplet.flapping),
            delayed_restarts: DelayedRestarts::new(),
            config,
            bus,
            desired_state,
            dispatcher,
            scheduler,
        }
    }

    pub fn config(&self) -> &HarmonizerConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn droplets(&self) -> &DropletRegistry {
        &self.droplets
    }

    pub fn delayed_restarts(&self) -> &DelayedRestarts {
        &self.delayed_restarts
    }

    /// Subscribe to every droplet event on the bus. Calling this again has
    /// no effect. Returns whether the subscription was new.
    pub fn prepare(self: &Arc<Self>) -> bool {
        let listener: Arc<dyn DropletListener> = Arc::new(HarmonizerListener {
            harmonizer: Arc::downgrade(self),
        });
        let registered = self
            .bus
            .subscribe_all(ListenerId::new(LISTENER_ID), listener);

        if registered > 0 {
            info!("Harmonizer listening for droplet events");
        }
        registered > 0
    }

    /// Route one event to its handler.
    pub fn handle_event(
        self: &Arc<Self>,
        droplet: &Arc<Droplet>,
        event: &DropletEvent,
    ) -> HarmonizerResult<()> {
        match event {
            DropletEvent::MissingInstances { indices } => {
                self.on_missing_instances(droplet, indices)
            }
            DropletEvent::ExtraInstances { instances } => {
                self.on_extra_instances(droplet, instances)
            }
            DropletEvent::ExitDea { index } => self.on_exit_dea(droplet, *index),
            DropletEvent::ExitCrashed { version, index } => {
                self.on_exit_crashed(droplet, version, *index)
            }
            DropletEvent::DropletUpdated => self.on_droplet_updated_event(droplet),
        }
    }

    #[instrument(skip(self, droplet), fields(droplet_id = %droplet.id()))]
    fn on_missing_instances(
        self: &Arc<Self>,
        droplet: &Arc<Droplet>,
        indices: &[InstanceIndex],
    ) -> HarmonizerResult<()> {
        if droplet.desired_state_update_required() {
            debug!("Desired state update pending, ignoring missing instances");
            return Ok(());
        }

        let now = Utc::now();
        let mut result = Ok(());
        for &index in indices {
            let flapping = droplet
                .get_instance(index)
                .filter(|instance| self.flapping.is_flapping(Some(instance), now));

            let outcome = match flapping {
                Some(instance) => self
                    .execute_flapping_policy(droplet.id(), index, &instance, false)
                    .map(|_| ()),
                None => self.start(droplet.id(), index, Priority::Normal),
            };

            // Keep going; one failed start must not hold back the others.
            if let Err(e) = outcome {
                result = Err(e);
            }
        }
        result
    }

    #[instrument(skip(self, droplet, instances), fields(droplet_id = %droplet.id()))]
    fn on_extra_instances(
        &self,
        droplet: &Arc<Droplet>,
        instances: &[InstanceKey],
    ) -> HarmonizerResult<()> {
        if droplet.desired_state_update_required() {
            debug!("Desired state update pending, ignoring extra instances");
            return Ok(());
        }
        if !self.desired_state.is_available() {
            warn!("Desired state unavailable, not stopping extra instances");
            return Ok(());
        }

        let targets: Vec<StopTarget> = instances
            .iter()
            .map(|key| StopTarget::new(key.clone(), StopReason::ExtraInstance))
            .collect();

        info!(count = targets.len(), "Stopping extra instances");
        self.dispatcher
            .stop_instances_immediately(droplet.id(), targets)
    }

    fn on_exit_dea(&self, droplet: &Arc<Droplet>, index: InstanceIndex) -> HarmonizerResult<()> {
        info!(droplet_id = %droplet.id(), index, "Instance lost with its agent");
        self.start(droplet.id(), index, Priority::High)
    }

    #[instrument(skip(self, droplet), fields(droplet_id = %droplet.id()))]
    fn on_exit_crashed(
        self: &Arc<Self>,
        droplet: &Arc<Droplet>,
        version: &Version,
        index: InstanceIndex,
    ) -> HarmonizerResult<()> {
        let instance = droplet
            .instance(&InstanceKey::new(version.clone(), index))
            .or_else(|| droplet.get_instance(index));

        match instance.filter(|i| self.flapping.is_flapping(Some(i), Utc::now())) {
            Some(instance) => self
                .execute_flapping_policy(droplet.id(), index, &instance, true)
                .map(|_| ()),
            None => self.start(droplet.id(), index, Priority::Low),
        }
    }

    fn on_droplet_updated_event(&self, droplet: &Arc<Droplet>) -> HarmonizerResult<()> {
        self.abort_all_pending_delayed_restarts(droplet.id());
        let requested = self.update_desired_state(droplet.id());
        droplet.set_desired_state_update_required(true);
        requested
    }

    /// Restart a flapping instance with back-off.
    ///
    /// With `immediate`, an instance that just reached the flapping
    /// threshold is restarted right away.
    #[instrument(skip(self, instance), fields(droplet_id = %droplet_id, instance = %instance.key))]
    pub fn execute_flapping_policy(
        self: &Arc<Self>,
        droplet_id: &DropletId,
        index: InstanceIndex,
        instance: &InstanceRecord,
        immediate: bool,
    ) -> HarmonizerResult<FlappingAction> {
        let crashes = instance.crash_count();
        let backoff = &self.config.backoff;

        if backoff.gives_up(crashes) {
            warn!(crashes, "Instance keeps crashing, giving up on restarts");
            return Ok(FlappingAction::GaveUp);
        }

        if self.delayed_restarts.is_pending(droplet_id, &instance.key) {
            debug!("Restart already pending");
            return Ok(FlappingAction::AlreadyPending);
        }

        let delay = backoff.delay_for(crashes, self.flapping.config().crash_threshold, immediate);
        if delay.is_zero() {
            self.start(droplet_id, index, Priority::Low)?;
            return Ok(FlappingAction::RestartedNow);
        }

        let Some(ticket) = self
            .delayed_restarts
            .reserve(droplet_id, &instance.key, delay)
        else {
            return Ok(FlappingAction::AlreadyPending);
        };

        let harmonizer = Arc::downgrade(self);
        let fired = ticket.clone();
        let handle = self.scheduler.schedule_after(
            delay,
            Box::new(move || fire_delayed_restart(&harmonizer, &fired)),
        );
        self.delayed_restarts.attach(&ticket, handle);

        info!(
            crashes,
            delay_secs = delay.as_secs(),
            "Flapping instance, restart delayed"
        );
        Ok(FlappingAction::Scheduled(delay))
    }

    /// Cancel every delayed restart of a droplet.
    pub fn abort_all_pending_delayed_restarts(&self, droplet_id: &DropletId) -> usize {
        self.delayed_restarts.cancel_all(droplet_id)
    }

    /// Ask the provider to refresh a droplet's desired state.
    pub fn update_desired_state(&self, droplet_id: &DropletId) -> HarmonizerResult<()> {
        self.desired_state.request_update(droplet_id)
    }

    pub(crate) fn start(
        &self,
        droplet_id: &DropletId,
        index: InstanceIndex,
        priority: Priority,
    ) -> HarmonizerResult<()> {
        info!(droplet_id = %droplet_id, index, priority = %priority, "Starting instance");
        self.dispatcher.start_instance(droplet_id, index, priority)
    }

    fn run_delayed_restart(&self, ticket: &RestartTicket) {
        if !self.delayed_restarts.take(ticket) {
            debug!(
                droplet_id = %ticket.droplet_id,
                instance = %ticket.instance,
                "Delayed restart was cancelled"
            );
            return;
        }

        if self.desired_state.is_available() {
            let wanted = self
                .desired_state
                .get(&ticket.droplet_id)
                .is_some_and(|desired| desired.wants_index(ticket.instance.index));
            if !wanted {
                debug!(
                    droplet_id = %ticket.droplet_id,
                    instance = %ticket.instance,
                    "Delayed restart no longer wanted"
                );
                return;
            }
        }

        if let Err(e) = self.start(&ticket.droplet_id, ticket.instance.index, Priority::Low) {
            warn!(
                droplet_id = %ticket.droplet_id,
                instance = %ticket.instance,
                error = %e,
                "Delayed restart failed"
            );
        }
    }
}

fn fire_delayed_restart(harmonizer: &Weak<Harmonizer>, ticket: &RestartTicket) {
    if let Some(harmonizer) = harmonizer.upgrade() {
        harmonizer.run_delayed_restart(ticket);
    }
}

impl std::fmt::Debug for Harmonizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harmonizer")
            .field("config", &self.config)
            .field("droplets", &self.droplets.len())
            .field("delayed_restarts", &self.delayed_restarts)
            .finish()
    }
}

/// Bus adapter. Holds the harmonizer weakly so the bus does not keep it alive.
struct HarmonizerListener {
    harmonizer: Weak<Harmonizer>,
}

impl DropletListener for HarmonizerListener {
    fn on_event(&self, droplet: &Arc<Droplet>, event: &DropletEvent) -> ListenerResult {
        let Some(harmonizer) = self.harmonizer.upgrade() else {
            return Ok(());
        };
        harmonizer
            .handle_event(droplet, event)
            .map_err(Into::into)
    }
}
