//! Droplet state machine configuration.
//!
//! Defines liveness and flapping thresholds. Both are operator-tunable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for droplet classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropletConfig {
    /// An instance with no heartbeat for this long is no longer live.
    pub heartbeat_staleness: Duration,

    /// Crash-loop detection.
    pub flapping: FlappingConfig,
}

impl Default for DropletConfig {
    fn default() -> Self {
        Self {
            heartbeat_staleness: Duration::from_secs(30),
            flapping: FlappingConfig::default(),
        }
    }
}

impl DropletConfig {
    /// How long an instance record is kept after its last report.
    ///
    /// Crash history lives on the record, so it must outlast the flapping
    /// window as well as the liveness window.
    pub fn retention(&self) -> Duration {
        self.heartbeat_staleness.max(self.flapping.window)
    }
}

/// Flapping detection thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlappingConfig {
    /// Crashes within `window` at which an instance is flapping.
    pub crash_threshold: u32,

    /// Sliding window for counting crashes.
    pub window: Duration,
}

impl Default for FlappingConfig {
    fn default() -> Self {
        Self {
            crash_threshold: 3,
            window: Duration::from_secs(300),
        }
    }
}
