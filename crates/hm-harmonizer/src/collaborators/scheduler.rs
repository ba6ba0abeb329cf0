//! One-shot timers for delayed restarts.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{HarmonizerError, HarmonizerResult};

/// Work run when a timer fires.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Cancels a scheduled task. Cancelling a fired timer is a no-op.
pub trait TimerHandle: Send + Sync {
    fn cancel(&self);
}

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule_after(&self, delay: Duration, task: TimerTask) -> Box<dyn TimerHandle>;
}

/// Schedules timers as tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on.
    pub fn current() -> HarmonizerResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| HarmonizerError::NoRuntime(e.to_string()))
    }
}

struct AbortOnCancel(JoinHandle<()>);

impl TimerHandle for AbortOnCancel {
    fn cancel(&self) {
        self.0.abort();
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, task: TimerTask) -> Box<dyn TimerHandle> {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        Box::new(AbortOnCancel(join))
    }
}

struct ManualTimer {
    due: Duration,
    cancelled: Arc<AtomicBool>,
    task: TimerTask,
}

#[derive(Default)]
struct ManualClock {
    elapsed: Duration,
    timers: Vec<ManualTimer>,
}

/// Virtual-time scheduler driven by [`ManualScheduler::advance`]; for tests.
#[derive(Default)]
pub struct ManualScheduler {
    clock: Mutex<ManualClock>,
}

struct ManualHandle(Arc<AtomicBool>);

impl TimerHandle for ManualHandle {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays of the timers still waiting to fire, relative to now.
    pub fn pending_delays(&self) -> Vec<Duration> {
        let clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        clock
            .timers
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .map(|t| t.due.saturating_sub(clock.elapsed))
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.pending_delays().len()
    }

    /// Move virtual time forward and run every timer that came due, in due
    /// order. Returns how many ran.
    pub fn advance(&self, by: Duration) -> usize {
        let mut due = {
            let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
            clock.elapsed += by;
            let now = clock.elapsed;

            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut clock.timers)
                .into_iter()
                .partition(|t| t.due <= now);
            clock.timers = waiting;
            due
        };
        due.sort_by_key(|t| t.due);

        // Tasks run unlocked; they may schedule more timers.
        let mut fired = 0;
        for timer in due {
            if !timer.cancelled.load(Ordering::SeqCst) {
                (timer.task)();
                fired += 1;
            }
        }
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_after(&self, delay: Duration, task: TimerTask) -> Box<dyn TimerHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        let due = clock.elapsed + delay;
        clock.timers.push(ManualTimer {
            due,
            cancelled: cancelled.clone(),
            task,
        });
        Box::new(ManualHandle(cancelled))
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> TimerTask {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_manual_scheduler_fires_when_due() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_after(Duration::from_secs(60), counter_task(&counter));
        scheduler.schedule_after(Duration::from_secs(120), counter_task(&counter));
        assert_eq!(
            scheduler.pending_delays(),
            vec![Duration::from_secs(60), Duration::from_secs(120)]
        );

        assert_eq!(scheduler.advance(Duration::from_secs(59)), 0);
        assert_eq!(scheduler.advance(Duration::from_secs(1)), 1);
        assert_eq!(scheduler.pending_delays(), vec![Duration::from_secs(60)]);
        assert_eq!(scheduler.advance(Duration::from_secs(60)), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_manual_cancel() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.schedule_after(Duration::from_secs(1), counter_task(&counter));
        handle.cancel();
        assert_eq!(scheduler.pending(), 0);

        assert_eq!(scheduler.advance(Duration::from_secs(5)), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Cancelling again is harmless.
        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler() {
        let scheduler = TokioScheduler::current().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_after(Duration::from_secs(30), counter_task(&counter));
        let cancelled = scheduler.schedule_after(Duration::from_secs(30), counter_task(&counter));
        cancelled.cancel();

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tokio_scheduler_requires_runtime() {
        assert!(matches!(
            TokioScheduler::current(),
            Err(HarmonizerError::NoRuntime(_))
        ));
    }
}
