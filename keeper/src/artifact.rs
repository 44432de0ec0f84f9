//! Artifact classes and captured artifacts.

use chrono::{DateTime, Utc};
use keeper_storage::ObjectKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::manifest::SnapshotId;

/// The three stores a snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactClass {
    /// Relational metadata store (database dump)
    Metadata,
    /// Document blob directory
    Documents,
    /// Vector index directory
    VectorIndex,
}

impl ArtifactClass {
    pub const ALL: [ArtifactClass; 3] = [
        ArtifactClass::Metadata,
        ArtifactClass::Documents,
        ArtifactClass::VectorIndex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactClass::Metadata => "metadata",
            ArtifactClass::Documents => "documents",
            ArtifactClass::VectorIndex => "vector_index",
        }
    }

    /// Key component used for this class in object storage.
    pub fn object_kind(&self) -> ObjectKind {
        match self {
            ArtifactClass::Metadata => ObjectKind::Metadata,
            ArtifactClass::Documents => ObjectKind::Documents,
            ArtifactClass::VectorIndex => ObjectKind::VectorIndex,
        }
    }

    /// Extension of the raw (unsealed) capture.
    pub fn raw_extension(&self) -> &'static str {
        match self {
            ArtifactClass::Metadata => "dump",
            ArtifactClass::Documents | ArtifactClass::VectorIndex => "tar",
        }
    }

    /// Parse a comma-separated class list; `all` selects every class.
    pub fn parse_list(s: &str) -> Result<Vec<ArtifactClass>> {
        let mut classes = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part.eq_ignore_ascii_case("all") {
                return Ok(Self::ALL.to_vec());
            }
            let class: ArtifactClass = part.parse().map_err(Error::Config)?;
            if !classes.contains(&class) {
                classes.push(class);
            }
        }
        classes.sort();
        Ok(classes)
    }
}

impl fmt::Display for ArtifactClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "metadata" | "meta" | "db" | "database" => Ok(ArtifactClass::Metadata),
            "documents" | "docs" => Ok(ArtifactClass::Documents),
            "vector_index" | "vectorindex" | "vector" | "index" => Ok(ArtifactClass::VectorIndex),
            _ => Err(format!(
                "Invalid artifact class '{}'. Use 'metadata', 'documents' or 'vector_index'",
                s
            )),
        }
    }
}

/// Whether the raw capture is a plain byte stream or a tar archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactShape {
    Stream,
    Archive,
}

/// One class's captured data for one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub class: ArtifactClass,
    pub snapshot_id: SnapshotId,
    pub shape: ArtifactShape,
    /// Size of the file at `local_path`
    pub size_bytes: u64,
    /// SHA-256 (hex) of the file at `local_path`
    pub checksum: String,
    /// SHA-256 of the raw capture, kept once the artifact is sealed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_size_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub local_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_location: Option<String>,
    pub verified: bool,
    pub compressed: bool,
    pub encrypted: bool,
    /// Identifier of the key used to encrypt (never the key itself)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

impl Artifact {
    /// Build a raw (unsealed, unverified) artifact from a freshly captured file.
    pub fn from_capture(
        class: ArtifactClass,
        snapshot_id: SnapshotId,
        shape: ArtifactShape,
        local_path: PathBuf,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let (checksum, size_bytes) = sha256_file(&local_path)?;
        Ok(Self {
            class,
            snapshot_id,
            shape,
            size_bytes,
            checksum,
            content_checksum: None,
            content_size_bytes: None,
            created_at,
            local_path,
            remote_location: None,
            verified: false,
            compressed: false,
            encrypted: false,
            key_id: None,
        })
    }

    pub fn is_sealed(&self) -> bool {
        self.content_checksum.is_some()
    }

    /// File extension of the artifact as stored, e.g. `tar.zst.enc`.
    pub fn extension(&self) -> String {
        let mut ext = self.class.raw_extension().to_string();
        if self.is_sealed() {
            match (self.compressed, self.encrypted) {
                (false, false) => ext.push_str(".sealed"),
                (compressed, encrypted) => {
                    if compressed {
                        ext.push_str(".zst");
                    }
                    if encrypted {
                        ext.push_str(".enc");
                    }
                }
            }
        }
        ext
    }

    /// Record the remote location. Set at most once.
    pub fn set_remote_location(&mut self, location: String) -> Result<()> {
        match &self.remote_location {
            Some(existing) if existing != &location => Err(Error::PublishFailed(format!(
                "{} artifact of {} already published to {}",
                self.class, self.snapshot_id, existing
            ))),
            _ => {
                self.remote_location = Some(location);
                Ok(())
            }
        }
    }
}

/// Stream a file through SHA-256, returning the hex digest and byte count.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}
