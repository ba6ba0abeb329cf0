//! Desired state sources

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use hm_types::{DesiredState, DropletId};

use crate::config::DesiredStateConfig;
use crate::error::{DaemonError, DaemonResult};

/// Desired state snapshot, keyed by droplet
pub type DesiredSnapshot = BTreeMap<DropletId, DesiredState>;

/// Loads the complete desired state
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn load(&self) -> DaemonResult<DesiredSnapshot>;
}

/// Fixed desired state from the configuration
pub struct StaticSource {
    droplets: DesiredSnapshot,
}

impl StaticSource {
    pub fn new(droplets: DesiredSnapshot) -> Self {
        Self { droplets }
    }
}

#[async_trait]
impl DesiredStateSource for StaticSource {
    async fn load(&self) -> DaemonResult<DesiredSnapshot> {
        Ok(self.droplets.clone())
    }
}

/// JSON file re-read on every load
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DesiredStateSource for FileSource {
    async fn load(&self) -> DaemonResult<DesiredSnapshot> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            DaemonError::DesiredState(format!("reading {}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            DaemonError::DesiredState(format!("parsing {}: {}", self.path.display(), e))
        })
    }
}

/// Pick the source the configuration asks for
pub fn from_config(config: &DesiredStateConfig) -> Box<dyn DesiredStateSource> {
    match &config.file {
        Some(path) => Box::new(FileSource::new(path.clone())),
        None => Box::new(StaticSource::new(config.droplets.clone())),
    }
}
