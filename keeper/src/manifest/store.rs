//! Manifest persistence: JSON next to local artifacts, optionally mirrored remotely.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use keeper_storage::{LocalStorage, ObjectKey, ObjectKind, ObjectStorage, StorageError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::{SnapshotId, SnapshotManifest};
use crate::error::{Error, Result};

/// Reads and writes manifests under `{backup_root}/{env}/manifests/` and the
/// remote `{env}/manifests/` mirror.
#[derive(Clone)]
pub struct ManifestStore {
    local: LocalStorage,
    remote: Option<Arc<dyn ObjectStorage>>,
}

impl ManifestStore {
    pub fn new(backup_root: impl Into<PathBuf>, remote: Option<Arc<dyn ObjectStorage>>) -> Self {
        Self {
            local: LocalStorage::new(backup_root),
            remote,
        }
    }

    pub fn backup_root(&self) -> &Path {
        self.local.base_path()
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Local path of a manifest file.
    pub fn local_path(&self, id: &SnapshotId) -> PathBuf {
        ObjectKey::manifest(id.environment(), id.as_str()).to_path_buf(self.local.base_path())
    }

    /// Persist a manifest locally. A manifest already persisted as final is
    /// never overwritten.
    #[instrument(skip(self, manifest), fields(snapshot_id = %manifest.snapshot_id, status = %manifest.status))]
    pub async fn save(&self, manifest: &SnapshotManifest) -> Result<()> {
        let key = key_for(&manifest.snapshot_id);

        match self.local.get(&key).await {
            Ok(existing) => {
                let existing: SnapshotManifest = serde_json::from_slice(&existing)?;
                if existing.is_final() {
                    return Err(Error::ManifestFinalized(manifest.snapshot_id.to_string()));
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let json = serde_json::to_vec_pretty(manifest)?;
        self.local.put(&key, Bytes::from(json)).await?;
        debug!("Saved manifest");
        Ok(())
    }

    /// Copy a finalized manifest to the remote mirror. Returns its location.
    #[instrument(skip(self, manifest), fields(snapshot_id = %manifest.snapshot_id))]
    pub async fn mirror(&self, manifest: &SnapshotManifest) -> Result<Option<String>> {
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        if !manifest.is_final() {
            return Err(Error::Config(format!(
                "Refusing to mirror non-final manifest {}",
                manifest.snapshot_id
            )));
        }
        let key = key_for(&manifest.snapshot_id);
        let json = serde_json::to_vec_pretty(manifest)?;
        remote.put(&key, Bytes::from(json)).await?;
        Ok(Some(remote.location(&key)))
    }

    /// Load a manifest, preferring the local copy over the mirror.
    #[instrument(skip(self), fields(snapshot_id = %id))]
    pub async fn load(&self, id: &SnapshotId) -> Result<SnapshotManifest> {
        let key = key_for(id);

        match self.local.get(&key).await {
            Ok(data) => return Ok(serde_json::from_slice(&data)?),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(remote) = &self.remote {
            match remote.get(&key).await {
                Ok(data) => {
                    debug!("Manifest found in remote mirror only");
                    return Ok(serde_json::from_slice(&data)?);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::SnapshotNotFound(id.to_string()))
    }

    /// All manifests of an environment, newest first. Local copies win over
    /// mirrored ones. Unreadable manifests are skipped with a warning.
    #[instrument(skip(self))]
    pub async fn list(&self, environment: &str) -> Result<Vec<SnapshotManifest>> {
        let mut found: BTreeMap<SnapshotId, SnapshotManifest> = BTreeMap::new();

        if let Some(remote) = &self.remote {
            match self.read_all(remote.as_ref(), environment).await {
                Ok(manifests) => {
                    for m in manifests {
                        found.insert(m.snapshot_id.clone(), m);
                    }
                }
                Err(e) => warn!(error = %e, "Could not list remote manifests, using local only"),
            }
        }

        for m in self.read_all(&self.local, environment).await? {
            found.insert(m.snapshot_id.clone(), m);
        }

        let mut manifests: Vec<_> = found.into_values().collect();
        sort_newest_first(&mut manifests);
        Ok(manifests)
    }

    async fn read_all(
        &self,
        storage: &dyn ObjectStorage,
        environment: &str,
    ) -> std::result::Result<Vec<SnapshotManifest>, StorageError> {
        let prefix = ObjectKey::prefix(environment, ObjectKind::Manifests);
        let mut manifests = Vec::new();

        for meta in storage.list(&prefix).await? {
            if !meta.key.name.ends_with(".json") {
                continue;
            }
            let data = match storage.get(&meta.key).await {
                Ok(d) => d,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            match serde_json::from_slice::<SnapshotManifest>(&data) {
                Ok(m) if m.environment == environment => manifests.push(m),
                Ok(_) => warn!(key = %meta.key, "Manifest environment mismatch, skipping"),
                Err(e) => warn!(key = %meta.key, error = %e, "Unreadable manifest, skipping"),
            }
        }

        Ok(manifests)
    }

    /// Delete a manifest locally and from the mirror.
    #[instrument(skip(self), fields(snapshot_id = %id))]
    pub async fn remove(&self, id: &SnapshotId) -> Result<()> {
        let key = key_for(id);
        self.local.delete(&key).await?;
        if let Some(remote) = &self.remote {
            remote.delete(&key).await?;
        }
        Ok(())
    }

    /// Next free sequence number for `environment` at `timestamp` (second
    /// precision). Call while holding the environment run lock.
    pub async fn next_sequence(&self, environment: &str, timestamp: DateTime<Utc>) -> Result<u32> {
        let probe = SnapshotId::new(environment, timestamp, 0)?;
        let mut highest = 0u32;

        let mut names: Vec<String> = self
            .local
            .list(&ObjectKey::prefix(environment, ObjectKind::Manifests))
            .await?
            .into_iter()
            .map(|m| m.key.name)
            .collect();
        if let Some(remote) = &self.remote {
            match remote
                .list(&ObjectKey::prefix(environment, ObjectKind::Manifests))
                .await
            {
                Ok(metas) => names.extend(metas.into_iter().map(|m| m.key.name)),
                Err(e) => warn!(error = %e, "Could not list remote manifests for sequence allocation"),
            }
        }

        for name in names {
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if let Ok(id) = SnapshotId::parse(stem) {
                if id.environment() == environment && id.timestamp() == probe.timestamp() {
                    highest = highest.max(id.sequence());
                }
            }
        }

        Ok(highest + 1)
    }
}

fn key_for(id: &SnapshotId) -> ObjectKey {
    ObjectKey::manifest(id.environment(), id.as_str())
}

/// Sort by snapshot timestamp, then sequence, newest first.
pub(crate) fn sort_newest_first(manifests: &mut [SnapshotManifest]) {
    manifests.sort_by(|a, b| {
        (b.snapshot_id.timestamp(), b.snapshot_id.sequence())
            .cmp(&(a.snapshot_id.timestamp(), a.snapshot_id.sequence()))
    });
}
