//! Command dispatch.
//!
//! The harmonizer decides; a [`Dispatcher`] carries the decision to whatever
//! actually starts and stops instances. Dispatch is fire-and-forget: a failed
//! command is logged and never retried, the next reconciliation pass
//! re-detects the divergence.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use hm_types::{DropletId, InstanceIndex, InstanceKey, Priority};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{HarmonizerError, HarmonizerResult};

/// Why an instance is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The instance is beyond the desired count or of a retired version.
    ExtraInstance,
    /// The whole droplet is gone from desired state.
    ExtraApp,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ExtraInstance => write!(f, "Extra instance"),
            StopReason::ExtraApp => write!(f, "Extra app"),
        }
    }
}

/// One instance to stop, labelled with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopTarget {
    #[serde(flatten)]
    pub instance: InstanceKey,
    pub reason: StopReason,
}

impl StopTarget {
    pub fn new(instance: InstanceKey, reason: StopReason) -> Self {
        Self { instance, reason }
    }
}

/// A corrective command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum NudgeCommand {
    Start {
        droplet_id: DropletId,
        index: InstanceIndex,
        priority: Priority,
    },
    Stop {
        droplet_id: DropletId,
        instances: Vec<StopTarget>,
    },
}

impl NudgeCommand {
    pub fn droplet_id(&self) -> &DropletId {
        match self {
            NudgeCommand::Start { droplet_id, .. } | NudgeCommand::Stop { droplet_id, .. } => {
                droplet_id
            }
        }
    }
}

/// Carries start and stop commands to the execution agents.
///
/// Implementations must not block and must not call back into the
/// harmonizer synchronously.
pub trait Dispatcher: Send + Sync {
    /// Start instance `index` of the droplet's live version.
    fn start_instance(
        &self,
        droplet_id: &DropletId,
        index: InstanceIndex,
        priority: Priority,
    ) -> HarmonizerResult<()>;

    /// Stop every listed instance now, in one batch.
    fn stop_instances_immediately(
        &self,
        droplet_id: &DropletId,
        instances: Vec<StopTarget>,
    ) -> HarmonizerResult<()>;
}

/// Forwards commands over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<NudgeCommand>,
}

impl ChannelDispatcher {
    pub fn new(tx: mpsc::UnboundedSender<NudgeCommand>) -> Self {
        Self { tx }
    }

    /// Create a dispatcher together with the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NudgeCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, command: NudgeCommand) -> HarmonizerResult<()> {
        self.tx
            .send(command)
            .map_err(|_| HarmonizerError::ChannelClosed("dispatcher"))
    }
}

impl Dispatcher for ChannelDispatcher {
    fn start_instance(
        &self,
        droplet_id: &DropletId,
        index: InstanceIndex,
        priority: Priority,
    ) -> HarmonizerResult<()> {
        self.send(NudgeCommand::Start {
            droplet_id: droplet_id.clone(),
            index,
            priority,
        })
    }

    fn stop_instances_immediately(
        &self,
        droplet_id: &DropletId,
        instances: Vec<StopTarget>,
    ) -> HarmonizerResult<()> {
        self.send(NudgeCommand::Stop {
            droplet_id: droplet_id.clone(),
            instances,
        })
    }
}

/// Records every command; for tests.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    commands: Mutex<Vec<NudgeCommand>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<NudgeCommand> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `(droplet, index, priority)` of every start.
    pub fn starts(&self) -> Vec<(DropletId, InstanceIndex, Priority)> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                NudgeCommand::Start {
                    droplet_id,
                    index,
                    priority,
                } => Some((droplet_id, index, priority)),
                NudgeCommand::Stop { .. } => None,
            })
            .collect()
    }

    /// Every stop batch.
    pub fn stops(&self) -> Vec<(DropletId, Vec<StopTarget>)> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                NudgeCommand::Stop {
                    droplet_id,
                    instances,
                } => Some((droplet_id, instances)),
                NudgeCommand::Start { .. } => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn record(&self, command: NudgeCommand) {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
    }
}

impl Dispatcher for RecordingDispatcher {
    fn start_instance(
        &self,
        droplet_id: &DropletId,
        index: InstanceIndex,
        priority: Priority,
    ) -> HarmonizerResult<()> {
        self.record(NudgeCommand::Start {
            droplet_id: droplet_id.clone(),
            index,
            priority,
        });
        Ok(())
    }

    fn stop_instances_immediately(
        &self,
        droplet_id: &DropletId,
        instances: Vec<StopTarget>,
    ) -> HarmonizerResult<()> {
        self.record(NudgeCommand::Stop {
            droplet_id: droplet_id.clone(),
            instances,
        });
        Ok(())
    }
}

/// Accepts and drops every command.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpDispatcher;

impl Dispatcher for NoOpDispatcher {
    fn start_instance(
        &self,
        droplet_id: &DropletId,
        index: InstanceIndex,
        priority: Priority,
    ) -> HarmonizerResult<()> {
        debug!(droplet_id = %droplet_id, index, priority = %priority, "No-op start");
        Ok(())
    }

    fn stop_instances_immediately(
        &self,
        droplet_id: &DropletId,
        instances: Vec<StopTarget>,
    ) -> HarmonizerResult<()> {
        debug!(droplet_id = %droplet_id, count = instances.len(), "No-op stop");
        Ok(())
    }
}

/// Rejects every command; for exercising failure paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingDispatcher;

impl Dispatcher for FailingDispatcher {
    fn start_instance(
        &self,
        droplet_id: &DropletId,
        index: InstanceIndex,
        _priority: Priority,
    ) -> HarmonizerResult<()> {
        Err(HarmonizerError::DispatchFailed {
            droplet_id: droplet_id.clone(),
            reason: format!("simulated failure starting index {}", index),
        })
    }

    fn stop_instances_immediately(
        &self,
        droplet_id: &DropletId,
        _instances: Vec<StopTarget>,
    ) -> HarmonizerResult<()> {
        Err(HarmonizerError::DispatchFailed {
            droplet_id: droplet_id.clone(),
            reason: "simulated failure stopping instances".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_labels() {
        assert_eq!(StopReason::ExtraApp.to_string(), "Extra app");
        assert_eq!(StopReason::ExtraInstance.to_string(), "Extra instance");
    }

    #[test]
    fn test_command_wire_format() {
        let command = NudgeCommand::Stop {
            droplet_id: DropletId::new("app"),
            instances: vec![StopTarget::new(
                InstanceKey::new("v1", 2),
                StopReason::ExtraApp,
            )],
        };

        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["command"], "stop");
        assert_eq!(json["droplet_id"], "app");
        assert_eq!(json["instances"][0]["version"], "v1");
        assert_eq!(json["instances"][0]["index"], 2);
        assert_eq!(json["instances"][0]["reason"], "extra_app");
    }

    #[tokio::test]
    async fn test_channel_dispatcher_forwards_and_reports_closure() {
        let (dispatcher, mut rx) = ChannelDispatcher::channel();
        let app = DropletId::new("app");

        dispatcher.start_instance(&app, 1, Priority::High).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(NudgeCommand::Start {
                droplet_id: app.clone(),
                index: 1,
                priority: Priority::High
            })
        );

        drop(rx);
        assert!(matches!(
            dispatcher.start_instance(&app, 1, Priority::High),
            Err(HarmonizerError::ChannelClosed(_))
        ));
    }

    #[test]
    fn test_recording_dispatcher() {
        let dispatcher = RecordingDispatcher::new();
        let app = DropletId::new("app");

        dispatcher.start_instance(&app, 0, Priority::Low).unwrap();
        dispatcher
            .stop_instances_immediately(
                &app,
                vec![StopTarget::new(InstanceKey::new("v1", 3), StopReason::ExtraInstance)],
            )
            .unwrap();

        assert_eq!(dispatcher.starts(), vec![(app.clone(), 0, Priority::Low)]);
        assert_eq!(dispatcher.stops().len(), 1);
        assert_eq!(dispatcher.commands()[1].droplet_id(), &app);

        dispatcher.clear();
        assert!(dispatcher.commands().is_empty());
    }
}
