//! HM Daemon library
//!
//! This module provides the core components of the health manager daemon:
//! - Configuration loading and validation
//! - Desired state sources
//! - The JSON-lines agent feed and command output
//! - The main loop driving the harmonizer

pub mod config;
pub mod daemon;
pub mod error;
pub mod source;
pub mod wire;

pub use config::DaemonConfig;
pub use daemon::{Daemon, RefreshRequests, RunSummary};
pub use error::{DaemonError, DaemonResult};
pub use source::{DesiredStateSource, FileSource, StaticSource};
pub use wire::{decode_line, write_commands, AgentMessage};
