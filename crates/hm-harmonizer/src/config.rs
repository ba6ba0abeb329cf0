//! Harmonizer configuration.

use std::time::Duration;

use hm_droplet::DropletConfig;
use serde::{Deserialize, Serialize};

/// Top-level harmonizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarmonizerConfig {
    /// Liveness and flapping thresholds for every droplet.
    pub droplet: DropletConfig,

    /// Restart back-off for flapping instances.
    pub backoff: RestartBackoffConfig,

    /// Drop expired instance records during the sweep.
    pub prune_expired_instances: bool,
}

impl Default for HarmonizerConfig {
    fn default() -> Self {
        Self {
            droplet: DropletConfig::default(),
            backoff: RestartBackoffConfig::default(),
            prune_expired_instances: true,
        }
    }
}

/// Back-off applied when restarting a flapping instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartBackoffConfig {
    /// Delay after the first crash past the flapping threshold.
    pub min_restart_delay: Duration,

    /// Upper bound for the delay.
    pub max_restart_delay: Duration,

    /// Stop restarting once an instance crashed more often than this.
    pub giveup_crash_count: Option<u32>,
}

impl Default for RestartBackoffConfig {
    fn default() -> Self {
        Self {
            min_restart_delay: Duration::from_secs(60),
            max_restart_delay: Duration::from_secs(480),
            giveup_crash_count: None,
        }
    }
}

impl RestartBackoffConfig {
    /// Delay before restarting an instance with `crashes` crashes in its
    /// current streak, given the flapping `threshold`.
    ///
    /// The delay doubles with every crash past the threshold, capped at
    /// `max_restart_delay`. With `immediate`, an instance that only just
    /// reached the threshold is restarted without delay.
    pub fn delay_for(&self, crashes: u32, threshold: u32, immediate: bool) -> Duration {
        if immediate && crashes <= threshold {
            return Duration::ZERO;
        }

        let shift = crashes.saturating_sub(threshold).min(31);
        self.min_restart_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_restart_delay)
            .min(self.max_restart_delay)
    }

    /// The instance has crashed too often to be restarted again.
    pub fn gives_up(&self, crashes: u32) -> bool {
        matches!(self.giveup_crash_count, Some(limit) if crashes > limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = RestartBackoffConfig::default();

        assert_eq!(backoff.delay_for(3, 3, false), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(4, 3, false), Duration::from_secs(120));
        assert_eq!(backoff.delay_for(5, 3, false), Duration::from_secs(240));
        assert_eq!(backoff.delay_for(6, 3, false), Duration::from_secs(480));
        assert_eq!(backoff.delay_for(7, 3, false), Duration::from_secs(480));
        assert_eq!(backoff.delay_for(200, 3, false), Duration::from_secs(480));
    }

    #[test]
    fn test_immediate_first_offense() {
        let backoff = RestartBackoffConfig::default();

        assert_eq!(backoff.delay_for(3, 3, true), Duration::ZERO);
        assert_eq!(backoff.delay_for(4, 3, true), Duration::from_secs(120));
    }

    #[test]
    fn test_give_up() {
        let mut backoff = RestartBackoffConfig::default();
        assert!(!backoff.gives_up(1_000));

        backoff.giveup_crash_count = Some(5);
        assert!(!backoff.gives_up(5));
        assert!(backoff.gives_up(6));
    }
}
