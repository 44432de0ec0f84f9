//! Hierarchical object keys for backup artifacts.
//!
//! Keys follow the pattern: `environment/kind/name`
//!
//! # Examples
//!
//! ```
//! use keeper_storage::{ObjectKey, ObjectKind};
//!
//! let key = ObjectKey::artifact("production", ObjectKind::Documents, "production-20260101T020000Z-001", "tar.zst");
//! assert_eq!(key.to_string(), "production/documents/production-20260101T020000Z-001.tar.zst");
//!
//! let key = ObjectKey::manifest("production", "production-20260101T020000Z-001");
//! assert_eq!(key.to_string(), "production/manifests/production-20260101T020000Z-001.json");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};

/// Kind of object, used as the second key component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// Relational metadata dumps
    Metadata,
    /// Document store archives
    Documents,
    /// Vector index archives
    VectorIndex,
    /// Snapshot manifests
    Manifests,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Metadata => "metadata",
            ObjectKind::Documents => "documents",
            ObjectKind::VectorIndex => "vector_index",
            ObjectKind::Manifests => "manifests",
        }
    }

    /// Parse kind from its key component.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "metadata" => Some(ObjectKind::Metadata),
            "documents" => Some(ObjectKind::Documents),
            "vector_index" => Some(ObjectKind::VectorIndex),
            "manifests" => Some(ObjectKind::Manifests),
            _ => None,
        }
    }
}

/// Key of a stored object.
///
/// Format: `environment/kind/name`. A key with an empty name is a prefix
/// covering every object of that kind in the environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub environment: String,
    pub kind: ObjectKind,
    pub name: String,
}

impl ObjectKey {
    /// Prefix key for all objects of `kind` in `environment`.
    pub fn prefix(environment: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            environment: environment.into(),
            kind,
            name: String::new(),
        }
    }

    /// Key for a sealed artifact: `{environment}/{kind}/{snapshot_id}.{ext}`.
    pub fn artifact(
        environment: impl Into<String>,
        kind: ObjectKind,
        snapshot_id: &str,
        extension: &str,
    ) -> Self {
        Self {
            environment: environment.into(),
            kind,
            name: format!("{}.{}", snapshot_id, extension),
        }
    }

    /// Key for a manifest mirror: `{environment}/manifests/{snapshot_id}.json`.
    pub fn manifest(environment: impl Into<String>, snapshot_id: &str) -> Self {
        Self::artifact(environment, ObjectKind::Manifests, snapshot_id, "json")
    }

    /// Check if this key is a prefix (no name).
    pub fn is_prefix(&self) -> bool {
        self.name.is_empty()
    }

    /// The `environment/kind` portion of the key.
    pub fn dir(&self) -> String {
        format!("{}/{}", self.environment, self.kind)
    }

    /// Convert to a filesystem path below `base`.
    pub fn to_path_buf(&self, base: &Path) -> PathBuf {
        let mut path = base.join(&self.environment).join(self.kind.as_str());
        if !self.name.is_empty() {
            path = path.join(&self.name);
        }
        path
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '/');
        let environment = parts.next().filter(|p| !p.is_empty())?;
        let kind = ObjectKind::parse(parts.next()?)?;
        let name = parts.next().unwrap_or_default();
        if name.contains('/') {
            return None;
        }

        Some(Self {
            environment: environment.to_string(),
            kind,
            name: name.to_string(),
        })
    }

    /// Reject keys that could escape their directory when mapped to a path.
    pub fn validate(&self) -> Result<()> {
        let bad = |s: &str| s.contains('/') || s.contains('\\') || s == "." || s == "..";
        if self.environment.is_empty() || bad(&self.environment) || bad(&self.name) {
            return Err(StorageError::InvalidKey(self.to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}/{}", self.environment, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.environment, self.kind, self.name)
        }
    }
}
