//! Content store for build artifacts.
//!
//! Artifacts are keyed by the identity of the plan that produced them. The
//! store is append-only: `put` of an identity that is already present keeps
//! the existing entry, and readers never observe a partially written one.
//!
//! # Layout
//!
//! ```text
//! store/
//! ├── objects/                # Packed artifacts
//! │   └── <plan-id>.tar
//! ├── meta/                   # Completion records, written last
//! │   └── <plan-id>.json
//! └── tmp/                    # Partial writes and build workspaces
//! ```

mod fs;
mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::PlanId;
use crate::util::hash::ContentHash;

pub use fs::FsStore;
pub use memory::MemoryStore;

/// A stored build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
  /// Identity of the plan that produced this artifact.
  pub id: PlanId,
  /// SHA-256 of the stored bytes.
  pub digest: ContentHash,
  pub size: u64,
  /// Location of the packed bytes, for stores backed by a filesystem.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("store I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid metadata for {id}: {message}")]
  Metadata { id: PlanId, message: String },

  #[error("stored artifact {id} is corrupt: expected digest {expected}, found {actual}")]
  Corrupt {
    id: PlanId,
    expected: ContentHash,
    actual: ContentHash,
  },
}

/// Append-only, content-addressed artifact storage.
#[async_trait]
pub trait ContentStore: Send + Sync {
  async fn has(&self, id: &PlanId) -> Result<bool, StoreError>;

  /// Store `bytes` under `id`.
  ///
  /// Idempotent: if `id` is already present the existing artifact is
  /// returned and `bytes` are discarded.
  async fn put(&self, id: &PlanId, bytes: Vec<u8>) -> Result<Artifact, StoreError>;

  async fn get(&self, id: &PlanId) -> Result<Option<Artifact>, StoreError>;

  /// The stored bytes, verified against the recorded digest.
  async fn read(&self, id: &PlanId) -> Result<Option<Vec<u8>>, StoreError>;

  /// Directory under which build workspaces are created. `None` means the
  /// system temp directory.
  fn scratch_dir(&self) -> Option<PathBuf> {
    None
  }
}
