//! Registry of known droplets.
//!
//! Droplets are created lazily on first report and live until the sweep
//! forgets them.

use std::sync::Arc;

use dashmap::DashMap;
use hm_types::DropletId;
use tracing::debug;

use crate::config::DropletConfig;
use crate::droplet::Droplet;
use crate::error::{DropletError, DropletResult};

/// Concurrent map of droplet id to droplet.
#[derive(Debug)]
pub struct DropletRegistry {
    droplets: DashMap<DropletId, Arc<Droplet>>,
    config: DropletConfig,
}

impl DropletRegistry {
    pub fn new(config: DropletConfig) -> Self {
        Self {
            droplets: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &DropletConfig {
        &self.config
    }

    /// Fetch a droplet, creating it on first sight.
    pub fn get_or_create(&self, id: &DropletId) -> Arc<Droplet> {
        if let Some(droplet) = self.droplets.get(id) {
            return droplet.clone();
        }

        self.droplets
            .entry(id.clone())
            .or_insert_with(|| {
                debug!(droplet_id = %id, "Tracking new droplet");
                Arc::new(Droplet::new(id.clone(), self.config.clone()))
            })
            .clone()
    }

    pub fn get(&self, id: &DropletId) -> Option<Arc<Droplet>> {
        self.droplets.get(id).map(|d| d.clone())
    }

    /// Like [`get`](Self::get), but an unknown droplet is an error.
    pub fn require(&self, id: &DropletId) -> DropletResult<Arc<Droplet>> {
        self.get(id).ok_or_else(|| DropletError::NotFound(id.clone()))
    }

    /// Ids of every tracked droplet, sorted.
    pub fn ids(&self) -> Vec<DropletId> {
        let mut ids: Vec<_> = self.droplets.iter().map(|d| d.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> Vec<Arc<Droplet>> {
        self.droplets.iter().map(|d| d.value().clone()).collect()
    }

    pub fn remove(&self, id: &DropletId) -> Option<Arc<Droplet>> {
        let removed = self.droplets.remove(id).map(|(_, d)| d);
        if removed.is_some() {
            debug!(droplet_id = %id, "Forgot droplet");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.droplets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.droplets.is_empty()
    }
}

impl Default for DropletRegistry {
    fn default() -> Self {
        Self::new(DropletConfig::default())
    }
}
