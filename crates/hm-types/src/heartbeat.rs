//! Agent reports: heartbeats and exit notices
//!
//! Agents send heartbeats for every instance they host and a separate exit
//! notice whenever an instance stops. Both carry the agent's own timestamp,
//! which is what orders reports for the same slot.

use crate::{DropletId, InstanceIndex, InstanceKey, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// State of an instance as reported by its agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Instance is booting
    Starting,
    /// Instance is serving
    Running,
    /// Agent considers the instance to be crash-looping
    Flapping,
    /// Instance crashed
    Crashed,
    /// Instance is gone (host lost or stopped)
    Down,
}

impl InstanceState {
    /// States that count as an instance occupying its slot.
    pub fn is_running(&self) -> bool {
        matches!(self, InstanceState::Starting | InstanceState::Running)
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, InstanceState::Crashed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::Flapping => "FLAPPING",
            InstanceState::Crashed => "CRASHED",
            InstanceState::Down => "DOWN",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`InstanceState`] from its wire name
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown instance state: {0}")]
pub struct ParseStateError(pub String);

impl FromStr for InstanceState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STARTING" => Ok(InstanceState::Starting),
            "RUNNING" => Ok(InstanceState::Running),
            "FLAPPING" => Ok(InstanceState::Flapping),
            "CRASHED" => Ok(InstanceState::Crashed),
            "DOWN" => Ok(InstanceState::Down),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}

/// One agent-reported observation of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub droplet_id: DropletId,
    pub version: Version,
    pub index: InstanceIndex,
    pub state: InstanceState,
    /// Agent-side time of the observation
    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    pub fn new(
        droplet_id: impl Into<DropletId>,
        version: impl Into<Version>,
        index: InstanceIndex,
        state: InstanceState,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            droplet_id: droplet_id.into(),
            version: version.into(),
            index,
            state,
            timestamp,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.version.clone(), self.index)
    }
}

/// Why an instance exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    /// The instance process crashed
    Crashed,
    /// The hosting agent is shutting down
    DeaShutdown,
    /// The hosting agent is being evacuated
    DeaEvacuation,
    /// The instance was stopped on request
    Stopped,
}

impl ExitReason {
    /// The instance is not at fault; its host went away.
    pub fn is_host_loss(&self) -> bool {
        matches!(self, ExitReason::DeaShutdown | ExitReason::DeaEvacuation)
    }
}

/// Agent report that an instance stopped running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitNotice {
    pub droplet_id: DropletId,
    pub version: Version,
    pub index: InstanceIndex,
    pub reason: ExitReason,
    pub timestamp: DateTime<Utc>,
}

impl ExitNotice {
    pub fn new(
        droplet_id: impl Into<DropletId>,
        version: impl Into<Version>,
        index: InstanceIndex,
        reason: ExitReason,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            droplet_id: droplet_id.into(),
            version: version.into(),
            index,
            reason,
            timestamp,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.version.clone(), self.index)
    }
}
