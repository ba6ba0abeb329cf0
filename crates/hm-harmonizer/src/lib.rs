//! # HM Harmonizer - Reconciliation Policy for Droplet Fleets
//!
//! The harmonizer listens to droplet events and issues the smallest set of
//! corrective commands that moves the fleet toward its desired state: start
//! what is missing, stop what is extra, and restart crash-looping instances
//! with back-off.
//!
//! ## Key Components
//!
//! - [`Harmonizer`]: Event-driven policy, batch intake and periodic sweep
//! - [`DelayedRestarts`]: Cancellable restarts of flapping instances
//! - [`collaborators`]: Desired-state provider, dispatcher and scheduler seams
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::Utc;
//! use hm_droplet::EventBus;
//! use hm_harmonizer::{
//!     Harmonizer, HarmonizerConfig,
//!     collaborators::{InMemoryDesiredState, ManualScheduler, RecordingDispatcher},
//! };
//! use hm_types::{DesiredState, DropletId};
//!
//! let desired = Arc::new(InMemoryDesiredState::new());
//! desired.set(DropletId::new("app"), DesiredState::new(2, "v1"));
//! let dispatcher = Arc::new(RecordingDispatcher::new());
//!
//! let harmonizer = Arc::new(Harmonizer::new(
//!     HarmonizerConfig::default(),
//!     Arc::new(EventBus::new()),
//!     desired.clone(),
//!     dispatcher.clone(),
//!     Arc::new(ManualScheduler::new()),
//! ));
//! harmonizer.prepare();
//!
//! // First sweep asks for the new droplet's desired state...
//! harmonizer.sweep(Utc::now());
//! // ...and the refresh starts both instances.
//! harmonizer
//!     .on_desired_state_refreshed(&DropletId::new("app"), Utc::now())
//!     .unwrap();
//! assert_eq!(dispatcher.starts().len(), 2);
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod collaborators;
pub mod config;
pub mod delayed;
pub mod error;
pub mod harmonizer;
pub mod intake;
pub mod sweep;

// Re-export main types
pub use config::{HarmonizerConfig, RestartBackoffConfig};
pub use delayed::{DelayedRestarts, PendingRestartInfo, RestartTicket};
pub use error::{HarmonizerError, HarmonizerResult};
pub use harmonizer::{FlappingAction, Harmonizer};
pub use intake::BatchReport;
pub use sweep::SweepReport;
