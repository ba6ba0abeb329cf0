//! Error types for hm-harmonizer crate.

use hm_droplet::DropletError;
use hm_types::DropletId;
use thiserror::Error;

/// Errors raised by the harmonizer and its collaborators.
#[derive(Debug, Error)]
pub enum HarmonizerError {
    /// The desired-state provider has no usable data.
    #[error("desired state unavailable")]
    DesiredStateUnavailable,

    /// A command could not be handed to the dispatcher.
    #[error("dispatch failed for droplet {droplet_id}: {reason}")]
    DispatchFailed {
        droplet_id: DropletId,
        reason: String,
    },

    /// The receiving end of a channel went away.
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    /// No tokio runtime to schedule timers on.
    #[error("no async runtime available: {0}")]
    NoRuntime(String),

    /// Droplet state machine error.
    #[error(transparent)]
    Droplet(#[from] DropletError),
}

/// Result type for harmonizer operations.
pub type HarmonizerResult<T> = Result<T, HarmonizerError>;
