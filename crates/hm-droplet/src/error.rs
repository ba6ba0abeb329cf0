//! Error types for hm-droplet crate.

use hm_types::DropletId;
use thiserror::Error;

/// Errors raised while feeding agent reports into a droplet.
#[derive(Debug, Error)]
pub enum DropletError {
    /// A report was routed to the wrong droplet.
    #[error("report for droplet {got} delivered to droplet {expected}")]
    DropletMismatch { expected: DropletId, got: DropletId },

    /// Droplet not known to the registry.
    #[error("droplet not found: {0}")]
    NotFound(DropletId),
}

/// Result type for droplet operations.
pub type DropletResult<T> = Result<T, DropletError>;
