//! Configuration for hm-daemon

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use hm_droplet::{DropletConfig, FlappingConfig};
use hm_harmonizer::{HarmonizerConfig, RestartBackoffConfig};
use hm_types::{DesiredState, DropletId};
use serde::{Deserialize, Serialize};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Reconciliation thresholds
    #[serde(default)]
    pub health: HealthSettings,

    /// Timer configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Where desired state comes from
    #[serde(default)]
    pub desired_state: DesiredStateConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Liveness, flapping and restart thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Seconds without heartbeat after which an instance is no longer live
    #[serde(default = "default_heartbeat_staleness")]
    pub heartbeat_staleness_secs: u64,

    /// Crashes within the flapping window that make an instance flapping
    #[serde(default = "default_crash_threshold")]
    pub flapping_crash_threshold: u32,

    /// Flapping window in seconds
    #[serde(default = "default_flapping_window")]
    pub flapping_window_secs: u64,

    /// First restart delay for a flapping instance, in seconds
    #[serde(default = "default_min_restart_delay")]
    pub min_restart_delay_secs: u64,

    /// Restart delay cap, in seconds
    #[serde(default = "default_max_restart_delay")]
    pub max_restart_delay_secs: u64,

    /// Stop restarting after this many crashes; unlimited when unset
    #[serde(default)]
    pub giveup_crash_count: Option<u32>,

    /// Drop expired instance records during sweeps
    #[serde(default = "default_true")]
    pub prune_expired_instances: bool,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            heartbeat_staleness_secs: default_heartbeat_staleness(),
            flapping_crash_threshold: default_crash_threshold(),
            flapping_window_secs: default_flapping_window(),
            min_restart_delay_secs: default_min_restart_delay(),
            max_restart_delay_secs: default_max_restart_delay(),
            giveup_crash_count: None,
            prune_expired_instances: true,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Fleet sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Desired state reload interval in seconds
    #[serde(default = "default_refresh_interval")]
    pub desired_state_refresh_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            desired_state_refresh_secs: default_refresh_interval(),
        }
    }
}

/// Desired state source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesiredStateConfig {
    /// JSON file mapping droplet ids to desired state; re-read on refresh
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Inline desired state, used when no file is configured
    #[serde(default)]
    pub droplets: BTreeMap<DropletId, DesiredState>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_heartbeat_staleness() -> u64 {
    30
}

fn default_crash_threshold() -> u32 {
    3
}

fn default_flapping_window() -> u64 {
    300
}

fn default_min_restart_delay() -> u64 {
    60
}

fn default_max_restart_delay() -> u64 {
    480
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then `HM_`
    /// environment variables (`HM_SCHEDULER__SWEEP_INTERVAL_SECS=5`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Add environment variables with HM_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("HM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Library configuration for the harmonizer
    pub fn harmonizer_config(&self) -> HarmonizerConfig {
        let health = &self.health;
        HarmonizerConfig {
            droplet: DropletConfig {
                heartbeat_staleness: Duration::from_secs(health.heartbeat_staleness_secs),
                flapping: FlappingConfig {
                    crash_threshold: health.flapping_crash_threshold,
                    window: Duration::from_secs(health.flapping_window_secs),
                },
            },
            backoff: RestartBackoffConfig {
                min_restart_delay: Duration::from_secs(health.min_restart_delay_secs),
                max_restart_delay: Duration::from_secs(health.max_restart_delay_secs),
                giveup_crash_count: health.giveup_crash_count,
            },
            prune_expired_instances: health.prune_expired_instances,
        }
    }

    /// Reject settings the harmonizer cannot work with
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.sweep_interval_secs == 0 {
            return Err("scheduler.sweep_interval_secs must be positive".to_string());
        }
        if self.scheduler.desired_state_refresh_secs == 0 {
            return Err("scheduler.desired_state_refresh_secs must be positive".to_string());
        }
        if self.health.min_restart_delay_secs > self.health.max_restart_delay_secs {
            return Err("health.min_restart_delay_secs exceeds max_restart_delay_secs".to_string());
        }
        if self.health.flapping_crash_threshold == 0 {
            return Err("health.flapping_crash_threshold must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.scheduler.sweep_interval_secs, 10);
        assert!(config.desired_state.file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_harmonizer_config_matches_library_defaults() {
        let config = DaemonConfig::default().harmonizer_config();
        let library = HarmonizerConfig::default();

        assert_eq!(
            config.droplet.heartbeat_staleness,
            library.droplet.heartbeat_staleness
        );
        assert_eq!(config.droplet.flapping, library.droplet.flapping);
        assert_eq!(config.backoff, library.backoff);
        assert_eq!(config.prune_expired_instances, library.prune_expired_instances);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: DaemonConfig = serde_json::from_str(
            r#"{
                "health": { "giveup_crash_count": 10 },
                "desired_state": {
                    "droplets": { "app": { "instance_count": 2, "live_version": "v1" } }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.health.giveup_crash_count, Some(10));
        assert_eq!(config.health.flapping_window_secs, 300);
        assert_eq!(
            config.desired_state.droplets.get(&DropletId::new("app")),
            Some(&DesiredState::new(2, "v1"))
        );
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = DaemonConfig::default();
        config.health.min_restart_delay_secs = 600;
        assert!(config.validate().is_err());
    }
}
