//! Desired state of a droplet as published by the platform's controller

use crate::{InstanceIndex, Version};
use serde::{Deserialize, Serialize};

/// Target configuration for one droplet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    /// Number of instances that should be running
    pub instance_count: u32,

    /// Version the instances should run
    pub live_version: Version,

    /// The provider could not confirm this entry on its last refresh
    #[serde(default)]
    pub stale: bool,
}

impl DesiredState {
    pub fn new(instance_count: u32, live_version: impl Into<Version>) -> Self {
        Self {
            instance_count,
            live_version: live_version.into(),
            stale: false,
        }
    }

    pub fn stale(mut self) -> Self {
        self.stale = true;
        self
    }

    /// Indices `0..instance_count`.
    pub fn indices(&self) -> impl Iterator<Item = InstanceIndex> {
        0..self.instance_count
    }

    pub fn wants_index(&self, index: InstanceIndex) -> bool {
        index < self.instance_count
    }
}
