//! Crash bookkeeping for a single instance slot.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on crash timestamps kept per slot.
const MAX_TRACKED_CRASHES: usize = 64;

/// Crash timestamps and the current crash streak of one instance slot.
///
/// `crash_count` is the number of crashes since the slot last stayed up for
/// a full flapping window; it drives restart back-off. `recent` holds the
/// individual timestamps used to count crashes inside the sliding window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashHistory {
    recent: VecDeque<DateTime<Utc>>,
    crash_count: u32,
    last_crash_at: Option<DateTime<Utc>>,
}

impl CrashHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a crash. Returns `false` for a crash already recorded or
    /// older than the latest one.
    pub fn record_crash(&mut self, at: DateTime<Utc>) -> bool {
        if matches!(self.last_crash_at, Some(last) if at <= last) {
            return false;
        }

        self.recent.push_back(at);
        if self.recent.len() > MAX_TRACKED_CRASHES {
            self.recent.pop_front();
        }
        self.crash_count = self.crash_count.saturating_add(1);
        self.last_crash_at = Some(at);
        true
    }

    /// Note that the slot was seen running at `at`. A run that began at
    /// least `window` after the last crash ends the streak.
    pub fn note_running(&mut self, at: DateTime<Utc>, window: Duration) {
        if let Some(last) = self.last_crash_at {
            let stable = at
                .signed_duration_since(last)
                .to_std()
                .map(|elapsed| elapsed >= window)
                .unwrap_or(false);
            if stable {
                self.crash_count = 0;
            }
        }
    }

    /// Crashes in the current streak.
    pub fn crash_count(&self) -> u32 {
        self.crash_count
    }

    pub fn last_crash_at(&self) -> Option<DateTime<Utc>> {
        self.last_crash_at
    }

    /// Crashes that happened within `window` before `now`.
    pub fn crashes_within(&self, window: Duration, now: DateTime<Utc>) -> u32 {
        self.recent
            .iter()
            .filter(|at| within(**at, now, window))
            .count() as u32
    }

    /// Forget timestamps that fell out of `window`.
    pub fn trim(&mut self, window: Duration, now: DateTime<Utc>) {
        while let Some(oldest) = self.recent.front() {
            if within(*oldest, now, window) {
                break;
            }
            self.recent.pop_front();
        }
    }
}

/// `at` is no older than `window` as of `now`. Future timestamps count.
pub(crate) fn within(at: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    now.signed_duration_since(at)
        .to_std()
        .map(|age| age <= window)
        .unwrap_or(true)
}
