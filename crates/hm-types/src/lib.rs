//! HM Types - Core types for fleet health reconciliation
//!
//! HM (Health Manager) keeps the instances actually running on the execution
//! agents in line with the desired state held by the platform's controller.
//! This crate holds the vocabulary shared by the state machine, the
//! harmonizer and the daemon.
//!
//! ## Key Concepts
//!
//! - **Droplet**: A deployable unit; may have several live versions at once
//! - **Instance**: One copy of a droplet at a given version and index
//! - **Heartbeat**: An agent's report of an instance it is hosting
//! - **Exit notice**: An agent's report that an instance stopped running
//! - **Desired state**: Target instance count and live version per droplet
//! - **Priority**: Urgency hint handed to the dispatcher with each start

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod desired;
pub mod heartbeat;
pub mod ids;
pub mod priority;

// Re-export main types
pub use desired::DesiredState;
pub use heartbeat::{ExitNotice, ExitReason, Heartbeat, InstanceState};
pub use ids::{DropletId, InstanceIndex, InstanceKey, Version};
pub use priority::Priority;
