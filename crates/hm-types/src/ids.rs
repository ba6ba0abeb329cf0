//! Strongly-typed identifiers for HM entities
//!
//! Droplet ids and versions are opaque strings handed out by the platform,
//! wrapped in newtype structs for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of an instance within a droplet, `0..instance_count`.
pub type InstanceIndex = u32;

/// Identifier of a deployable unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DropletId(String);

impl DropletId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DropletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DropletId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Version of a droplet's code and configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Version {
    fn from(version: &str) -> Self {
        Self::new(version)
    }
}

/// Identifies one instance slot of a droplet: a (version, index) pair.
///
/// Displays as `{version}-{index}`, which is the instance identifier the
/// dispatcher receives in reason-labelled stop requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub version: Version,
    pub index: InstanceIndex,
}

impl InstanceKey {
    pub fn new(version: impl Into<Version>, index: InstanceIndex) -> Self {
        Self {
            version: version.into(),
            index,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.version, self.index)
    }
}

impl From<String> for Version {
    fn from(version: String) -> Self {
        Self(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_key_display() {
        let key = InstanceKey::new("version-1", 0);
        assert_eq!(key.to_string(), "version-1-0");
    }

    #[test]
    fn test_instance_key_ordering() {
        let mut keys = vec![
            InstanceKey::new("v2", 0),
            InstanceKey::new("v1", 3),
            InstanceKey::new("v1", 1),
        ];
        keys.sort();
        assert_eq!(keys[0], InstanceKey::new("v1", 1));
        assert_eq!(keys[2], InstanceKey::new("v2", 0));
    }

    #[test]
    fn test_droplet_id_is_transparent_in_json() {
        let id = DropletId::new("app-id");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"app-id\"");
    }
}
