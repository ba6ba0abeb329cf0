//! Error types for hm-daemon

use hm_harmonizer::HarmonizerError;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Desired state could not be loaded
    #[error("Desired state error: {0}")]
    DesiredState(String),

    /// Malformed agent message or command encoding failure
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Harmonizer error
    #[error("Harmonizer error: {0}")]
    Harmonizer(#[from] HarmonizerError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
