//! Artifact verification.
//!
//! The verifier recomputes an artifact's checksum from disk, independently
//! of whatever the adapter or sealer reported, and optionally probes its
//! structure: archives are read end to end and checked against the class's
//! entry policy; sealed containers are opened and their content checksum
//! recomputed.

use serde::{Deserialize, Serialize};

use crate::adapters::archive::{self, ProbedEntry};
use crate::artifact::{sha256_file, Artifact, ArtifactShape};
use crate::error::{Error, Result};
use crate::seal::{open_container, EncryptionKey, HashingReader};

/// Structural checks for one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyPolicy {
    /// Run the readability probe (checksum recomputation always runs)
    pub probe: bool,
    /// Archive entries that must be present
    pub required_entries: Vec<String>,
    /// Minimum number of regular files in an archive
    pub min_entries: usize,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            probe: true,
            required_entries: Vec::new(),
            min_entries: 0,
        }
    }
}

impl VerifyPolicy {
    fn check_entries(&self, entries: &[ProbedEntry]) -> Result<()> {
        let files = entries.iter().filter(|e| !e.is_dir).count();
        if files < self.min_entries {
            return Err(Error::VerificationFailed(format!(
                "archive has {} files, policy requires at least {}",
                files, self.min_entries
            )));
        }
        let missing: Vec<&str> = self
            .required_entries
            .iter()
            .map(|r| r.trim_matches('/'))
            .filter(|r| !entries.iter().any(|e| e.path == *r))
            .collect();
        if !missing.is_empty() {
            return Err(Error::VerificationFailed(format!(
                "archive is missing required entries: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Verifier {
    key: Option<EncryptionKey>,
}

impl Verifier {
    pub fn new(key: Option<EncryptionKey>) -> Self {
        Self { key }
    }

    /// Check `artifact` against its recorded checksum and the policy.
    /// Blocking; run off the async runtime.
    pub fn verify(&self, artifact: &Artifact, policy: &VerifyPolicy) -> Result<()> {
        let (checksum, size) = sha256_file(&artifact.local_path).map_err(|e| {
            Error::VerificationFailed(format!(
                "{} unreadable: {}",
                artifact.local_path.display(),
                e
            ))
        })?;
        if size != artifact.size_bytes {
            return Err(Error::VerificationFailed(format!(
                "{} size mismatch: recorded {}, found {}",
                artifact.class, artifact.size_bytes, size
            )));
        }
        if checksum != artifact.checksum {
            return Err(Error::VerificationFailed(format!(
                "{} checksum mismatch: recorded {}, found {}",
                artifact.class, artifact.checksum, checksum
            )));
        }

        if !policy.probe {
            return Ok(());
        }

        match &artifact.content_checksum {
            Some(expected) => self.probe_container(artifact, expected, policy),
            None if artifact.shape == ArtifactShape::Archive => {
                let entries = archive::probe_file(&artifact.local_path)
                    .map_err(|e| Error::VerificationFailed(format!("archive unreadable: {}", e)))?;
                policy.check_entries(&entries)
            }
            None => Ok(()),
        }
    }

    /// Open the container, stream its content through the hash and, for
    /// archives, through the tar reader at the same time.
    fn probe_container(&self, artifact: &Artifact, expected: &str, policy: &VerifyPolicy) -> Result<()> {
        if artifact.encrypted && self.key.is_none() {
            // Without the key only the header can be checked
            let header = crate::seal::inspect_header(&artifact.local_path)?;
            if !header.encrypted {
                return Err(Error::VerificationFailed(
                    "container header disagrees with recorded encryption flag".into(),
                ));
            }
            return Ok(());
        }

        let reader = open_container(&artifact.local_path, self.key.as_ref())?;
        let mut hashing = HashingReader::new(reader);

        if artifact.shape == ArtifactShape::Archive {
            let entries = archive::probe(&mut hashing)
                .map_err(|e| Error::VerificationFailed(format!("archive unreadable: {}", e)))?;
            policy.check_entries(&entries)?;
        }

        let (checksum, size) = hashing
            .finish()
            .map_err(|e| Error::VerificationFailed(format!("container unreadable: {}", e)))?;
        if checksum != expected {
            return Err(Error::VerificationFailed(format!(
                "{} content checksum mismatch: recorded {}, found {}",
                artifact.class, expected, checksum
            )));
        }
        if let Some(recorded) = artifact.content_size_bytes {
            if recorded != size {
                return Err(Error::VerificationFailed(format!(
                    "{} content size mismatch: recorded {}, found {}",
                    artifact.class, recorded, size
                )));
            }
        }
        Ok(())
    }
}

/// Mark an artifact verified. Only call after `Verifier::verify` succeeded.
pub fn mark_verified(mut artifact: Artifact) -> Artifact {
    artifact.verified = true;
    artifact
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactClass;
    use crate::manifest::SnapshotId;
    use crate::seal::Sealer;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn id() -> SnapshotId {
        SnapshotId::parse("prod-20260101T020000Z-001").unwrap()
    }

    fn archive_artifact(temp: &Path) -> Artifact {
        let src = temp.join("index");
        fs::create_dir_all(src.join("segments")).unwrap();
        fs::write(src.join("meta.json"), "{}").unwrap();
        fs::write(src.join("segments/1.bin"), vec![3u8; 2048]).unwrap();
        let dest = temp.join(format!("{}.tar", id()));
        archive::pack(&src, &dest, &CancellationToken::new()).unwrap();
        Artifact::from_capture(
            ArtifactClass::VectorIndex,
            id(),
            ArtifactShape::Archive,
            dest,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_verify_raw_archive() {
        let temp = TempDir::new().unwrap();
        let artifact = archive_artifact(temp.path());
        let policy = VerifyPolicy {
            probe: true,
            required_entries: vec!["meta.json".into()],
            min_entries: 2,
        };
        Verifier::default().verify(&artifact, &policy).unwrap();
        assert!(mark_verified(artifact).verified);
    }

    #[test]
    fn test_policy_violations() {
        let temp = TempDir::new().unwrap();
        let artifact = archive_artifact(temp.path());
        let missing = VerifyPolicy {
            required_entries: vec!["manifest.bin".into()],
            ..Default::default()
        };
        let err = Verifier::default().verify(&artifact, &missing).unwrap_err();
        assert!(err.to_string().contains("manifest.bin"));

        let too_few = VerifyPolicy {
            min_entries: 10,
            ..Default::default()
        };
        assert!(Verifier::default().verify(&artifact, &too_few).is_err());

        // Probes off: structure is not checked, checksum still is
        let off = VerifyPolicy {
            probe: false,
            ..too_few
        };
        Verifier::default().verify(&artifact, &off).unwrap();
    }

    #[test]
    fn test_checksum_mismatch_fails_even_without_probe() {
        let temp = TempDir::new().unwrap();
        let artifact = archive_artifact(temp.path());
        let mut bytes = fs::read(&artifact.local_path).unwrap();
        bytes[600] ^= 1;
        fs::write(&artifact.local_path, bytes).unwrap();

        let off = VerifyPolicy {
            probe: false,
            ..Default::default()
        };
        assert!(matches!(
            Verifier::default().verify(&artifact, &off),
            Err(Error::VerificationFailed(_))
        ));
    }

    #[test]
    fn test_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        let artifact = archive_artifact(temp.path());
        fs::remove_file(&artifact.local_path).unwrap();
        assert!(Verifier::default()
            .verify(&artifact, &VerifyPolicy::default())
            .is_err());
    }

    #[test]
    fn test_verify_sealed_container() {
        let temp = TempDir::new().unwrap();
        let raw = mark_verified(archive_artifact(temp.path()));
        let sealed = Sealer::new(3, None).seal(&raw, true, false).unwrap();

        let policy = VerifyPolicy {
            required_entries: vec!["segments/1.bin".into()],
            ..Default::default()
        };
        Verifier::default().verify(&sealed, &policy).unwrap();

        // Recorded content checksum disagreeing with the payload is caught
        let mut lying = sealed.clone();
        lying.content_checksum = Some("00".repeat(32));
        assert!(Verifier::default().verify(&lying, &policy).is_err());
    }

    #[test]
    fn test_encrypted_container_without_key_checks_header() {
        let temp = TempDir::new().unwrap();
        let raw = mark_verified(archive_artifact(temp.path()));
        let key = crate::seal::EncryptionKey::from_hex(&"11".repeat(32)).unwrap();
        let sealed = Sealer::new(3, Some(key.clone())).seal(&raw, true, true).unwrap();

        Verifier::default()
            .verify(&sealed, &VerifyPolicy::default())
            .unwrap();
        Verifier::new(Some(key))
            .verify(&sealed, &VerifyPolicy::default())
            .unwrap();
    }
}
