//! Flapping (crash-loop) detection.

use chrono::{DateTime, Utc};
use hm_types::InstanceState;

use crate::config::FlappingConfig;
use crate::instance::InstanceRecord;

/// Classifies instance slots as flapping.
#[derive(Debug, Clone, Copy)]
pub struct FlappingDetector {
    config: FlappingConfig,
}

impl FlappingDetector {
    pub fn new(config: FlappingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FlappingConfig {
        &self.config
    }

    /// An agent-reported FLAPPING state is taken as is; otherwise the slot
    /// is flapping once it crashed `crash_threshold` times inside the window.
    pub fn is_flapping(&self, instance: Option<&InstanceRecord>, now: DateTime<Utc>) -> bool {
        let Some(instance) = instance else {
            return false;
        };

        if instance.state == InstanceState::Flapping {
            return true;
        }

        instance.crashes.crashes_within(self.config.window, now) >= self.config.crash_threshold
    }
}

impl Default for FlappingDetector {
    fn default() -> Self {
        Self::new(FlappingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use hm_types::{DropletId, InstanceKey};

    fn instance(state: InstanceState, crash_ages: &[i64], now: DateTime<Utc>) -> InstanceRecord {
        let mut record = InstanceRecord::new(
            DropletId::new("app"),
            InstanceKey::new("v1", 0),
            state,
            now,
            1,
        );
        for age in crash_ages {
            record
                .crashes
                .record_crash(now - ChronoDuration::seconds(*age));
        }
        record
    }

    #[test]
    fn test_reported_flapping_is_authoritative() {
        let now = Utc::now();
        let detector = FlappingDetector::default();
        let record = instance(InstanceState::Flapping, &[], now);
        assert!(detector.is_flapping(Some(&record), now));
    }

    #[test]
    fn test_crash_threshold() {
        let now = Utc::now();
        let detector = FlappingDetector::default();

        let two = instance(InstanceState::Crashed, &[30, 20], now);
        assert!(!detector.is_flapping(Some(&two), now));

        let three = instance(InstanceState::Crashed, &[30, 20, 10], now);
        assert!(detector.is_flapping(Some(&three), now));
    }

    #[test]
    fn test_old_crashes_do_not_count() {
        let now = Utc::now();
        let detector = FlappingDetector::default();
        let record = instance(InstanceState::Running, &[900, 800, 10], now);
        assert!(!detector.is_flapping(Some(&record), now));
    }

    #[test]
    fn test_unknown_instance_is_not_flapping() {
        let detector = FlappingDetector::default();
        assert!(!detector.is_flapping(None, Utc::now()));
    }
}
