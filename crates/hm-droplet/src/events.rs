//! Droplet events and the in-process bus that delivers them.
//!
//! Each controller owns one [`EventBus`] and hands it to the droplets'
//! comparison passes and to the listeners that react to them. Delivery is
//! synchronous, in registration order, and isolated per listener: a listener
//! that fails or panics is logged and the remaining listeners still run.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use hm_types::{InstanceIndex, InstanceKey, Version};
use tracing::{debug, error};
use uuid::Uuid;

use crate::droplet::Droplet;

/// Kinds of droplet events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MissingInstances,
    ExtraInstances,
    ExitDea,
    ExitCrashed,
    DropletUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::MissingInstances,
        EventKind::ExtraInstances,
        EventKind::ExitDea,
        EventKind::ExitCrashed,
        EventKind::DropletUpdated,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::MissingInstances => "missing_instances",
            EventKind::ExtraInstances => "extra_instances",
            EventKind::ExitDea => "exit_dea",
            EventKind::ExitCrashed => "exit_crashed",
            EventKind::DropletUpdated => "droplet_updated",
        };
        f.write_str(name)
    }
}

/// A state transition raised by a droplet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropletEvent {
    /// Indices below the desired count with no live instance of the live version.
    MissingInstances { indices: Vec<InstanceIndex> },

    /// Live instances that should not be running.
    ExtraInstances { instances: Vec<InstanceKey> },

    /// An instance went away together with its agent.
    ExitDea { index: InstanceIndex },

    /// An instance crashed.
    ExitCrashed { version: Version, index: InstanceIndex },

    /// The droplet's desired state changed underneath it.
    DropletUpdated,
}

impl DropletEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DropletEvent::MissingInstances { .. } => EventKind::MissingInstances,
            DropletEvent::ExtraInstances { .. } => EventKind::ExtraInstances,
            DropletEvent::ExitDea { .. } => EventKind::ExitDea,
            DropletEvent::ExitCrashed { .. } => EventKind::ExitCrashed,
            DropletEvent::DropletUpdated => EventKind::DropletUpdated,
        }
    }
}

/// Error a listener may return; logged by the bus.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a single listener invocation.
pub type ListenerResult = Result<(), ListenerError>;

/// Receives droplet events.
///
/// The droplet reference identifies which droplet the event concerns.
pub trait DropletListener: Send + Sync {
    fn on_event(&self, droplet: &Arc<Droplet>, event: &DropletEvent) -> ListenerResult;
}

impl<F> DropletListener for F
where
    F: Fn(&Arc<Droplet>, &DropletEvent) -> ListenerResult + Send + Sync,
{
    fn on_event(&self, droplet: &Arc<Droplet>, event: &DropletEvent) -> ListenerResult {
        self(droplet, event)
    }
}

/// Identifies a listener registration so it can be made idempotent and removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(String);

impl ListenerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener:{}", self.0)
    }
}

struct Registration {
    id: ListenerId,
    kind: EventKind,
    listener: Arc<dyn DropletListener>,
}

/// Synchronous publish/subscribe keyed by event kind.
#[derive(Default)]
pub struct EventBus {
    registrations: RwLock<Vec<Registration>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `kind`. Returns `false` without registering
    /// when `id` is already subscribed to `kind`.
    pub fn subscribe(
        &self,
        kind: EventKind,
        id: ListenerId,
        listener: Arc<dyn DropletListener>,
    ) -> bool {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if registrations
            .iter()
            .any(|r| r.kind == kind && r.id == id)
        {
            return false;
        }

        debug!(listener = %id, kind = %kind, "Registering droplet listener");
        registrations.push(Registration { id, kind, listener });
        true
    }

    /// Register `listener` for every event kind. Returns the number of new
    /// registrations.
    pub fn subscribe_all(&self, id: ListenerId, listener: Arc<dyn DropletListener>) -> usize {
        EventKind::ALL
            .iter()
            .filter(|kind| self.subscribe(**kind, id.clone(), listener.clone()))
            .count()
    }

    /// Remove every registration made under `id`.
    pub fn unsubscribe(&self, id: &ListenerId) {
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| &r.id != id);
    }

    pub fn remove_all_listeners(&self) {
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn listener_count(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to every listener registered for its kind, in
    /// registration order. Returns the number of listeners that succeeded.
    pub fn notify(&self, droplet: &Arc<Droplet>, event: &DropletEvent) -> usize {
        let kind = event.kind();

        // Snapshot so listeners may (un)subscribe while being notified.
        let targets: Vec<(ListenerId, Arc<dyn DropletListener>)> = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| (r.id.clone(), r.listener.clone()))
            .collect();

        let mut delivered = 0;
        for (id, listener) in targets {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(droplet, event)));

            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!(
                        listener = %id,
                        droplet_id = %droplet.id(),
                        kind = %kind,
                        error = %e,
                        "Droplet listener failed"
                    );
                }
                Err(_) => {
                    error!(
                        listener = %id,
                        droplet_id = %droplet.id(),
                        kind = %kind,
                        "Droplet listener panicked"
                    );
                }
            }
        }

        delivered
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
