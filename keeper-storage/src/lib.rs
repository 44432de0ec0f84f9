//! Object storage abstraction for Keeper backups.
//!
//! This crate provides the `ObjectStorage` trait that the remote publisher,
//! the manifest mirror and the retention manager use to reach off-host
//! storage. Backends are pluggable (mounted directory, S3) without changing
//! orchestrator code.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Orchestrator                                │
//! │  ┌───────────┐ ┌───────────┐ ┌───────────┐   │
//! │  │ Publisher │ │ Manifests │ │ Retention │   │
//! │  └─────┬─────┘ └─────┬─────┘ └─────┬─────┘   │
//! │        └─────────────┼─────────────┘         │
//! │                      ▼                       │
//! │             ┌─────────────────┐              │
//! │             │  ObjectStorage  │              │
//! │             └────────┬────────┘              │
//! │             ┌────────┴────────┐              │
//! │             ▼                 ▼              │
//! │       ┌──────────┐      ┌──────────┐         │
//! │       │  Local   │      │    S3    │         │
//! │       └──────────┘      └──────────┘         │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Object Keys
//!
//! ```text
//! environment/kind/name
//!
//! production/metadata/production-20260101T020000Z-001.dump.zst
//! production/documents/production-20260101T020000Z-001.tar.zst.enc
//! production/manifests/production-20260101T020000Z-001.json
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use keeper_storage::{LocalStorage, ObjectStorage, ObjectKey, ObjectKind};
//! use bytes::Bytes;
//!
//! # async fn example() -> keeper_storage::Result<()> {
//! let storage = LocalStorage::new("/mnt/offsite");
//!
//! let key = ObjectKey::manifest("production", "production-20260101T020000Z-001");
//! storage.put(&key, Bytes::from("{}")).await?;
//!
//! let manifests = storage
//!     .list(&ObjectKey::prefix("production", ObjectKind::Manifests))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `s3` - Enable S3/object storage backend (requires `object_store`)
//! - `full` - Enable all features

mod error;
mod key;
mod local;
mod traits;

#[cfg(feature = "s3")]
mod s3;

pub use error::{Result, StorageError};
pub use key::{ObjectKey, ObjectKind};
pub use local::LocalStorage;
pub use traits::{ObjectMeta, ObjectStorage};

#[cfg(feature = "s3")]
pub use s3::{S3Config, S3Storage};

// Re-export bytes for convenience
pub use bytes::Bytes;
