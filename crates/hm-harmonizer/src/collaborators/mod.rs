//! External collaborators of the harmonizer.
//!
//! Each seam is a trait with a production implementation and test doubles.

mod desired;
mod dispatcher;
mod scheduler;

pub use desired::{DesiredStateProvider, InMemoryDesiredState};
pub use dispatcher::{
    ChannelDispatcher, Dispatcher, FailingDispatcher, NoOpDispatcher, NudgeCommand,
    RecordingDispatcher, StopReason, StopTarget,
};
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TimerTask, TokioScheduler};
