//! # HM Droplet - Instance State Machine for Fleet Health Reconciliation
//!
//! This crate tracks what the execution agents report about each droplet and
//! turns it into events describing how the fleet diverges from its desired
//! state.
//!
//! ## Key Concepts
//!
//! - [`Droplet`]: All known instance slots of one deployable unit, across
//!   versions. Ingests heartbeats and exit notices; its comparison pass
//!   raises missing/extra/exit events.
//! - [`InstanceRecord`]: Latest observation of one (version, index) slot.
//! - [`CrashHistory`]: Crash timestamps and crash streak of a slot.
//! - [`FlappingDetector`]: Crash-loop classification.
//! - [`EventBus`]: Synchronous, per-controller publish/subscribe.
//! - [`DropletRegistry`]: Lazily populated map of droplets.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::Utc;
//! use hm_droplet::{Droplet, DropletConfig, EventBus};
//! use hm_types::{DesiredState, DropletId, Heartbeat, InstanceState};
//!
//! let bus = EventBus::new();
//! let droplet = Arc::new(Droplet::new(DropletId::new("app"), DropletConfig::default()));
//!
//! let now = Utc::now();
//! droplet
//!     .process_heartbeat(&Heartbeat::new("app", "v1", 0, InstanceState::Running, now))
//!     .unwrap();
//!
//! let report = droplet.analyze(Some(&DesiredState::new(2, "v1")), now, &bus);
//! assert_eq!(report.missing, vec![1]);
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod crash;
pub mod droplet;
pub mod error;
pub mod events;
pub mod flapping;
pub mod instance;
pub mod registry;

// Re-export main types
pub use config::{DropletConfig, FlappingConfig};
pub use crash::CrashHistory;
pub use droplet::{AnalysisReport, Droplet, ExitOutcome, HeartbeatOutcome};
pub use error::{DropletError, DropletResult};
pub use events::{
    DropletEvent, DropletListener, EventBus, EventKind, ListenerError, ListenerId, ListenerResult,
};
pub use flapping::FlappingDetector;
pub use instance::InstanceRecord;
pub use registry::DropletRegistry;
