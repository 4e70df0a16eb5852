//! Filesystem-backed content store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{Artifact, ContentStore, StoreError};
use crate::paths::store_dir;
use crate::plan::PlanId;
use crate::util::hash::{ContentHash, hash_bytes};

/// Bumped when the record layout changes.
const RECORD_VERSION: u32 = 1;

/// Completion record written after the object is in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactRecord {
  version: u32,
  id: PlanId,
  digest: ContentHash,
  size: u64,
}

#[derive(Debug)]
pub struct FsStore {
  root: PathBuf,
  counter: AtomicU64,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
  move |source| StoreError::Io {
    path: path.to_path_buf(),
    source,
  }
}

impl FsStore {
  /// Open (creating if needed) a store rooted at `root`.
  pub async fn open(root: &Path) -> Result<Self, StoreError> {
    for sub in ["objects", "meta", "tmp"] {
      let dir = root.join(sub);
      tokio::fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;
    }
    debug!(root = ?root, "opened store");
    Ok(Self {
      root: root.to_path_buf(),
      counter: AtomicU64::new(0),
    })
  }

  /// Open the store at the configured location (`OVERLAY_STORE` or the
  /// default data directory).
  pub async fn open_default() -> Result<Self, StoreError> {
    Self::open(&store_dir()).await
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn object_path(&self, id: &PlanId) -> PathBuf {
    self.root.join("objects").join(format!("{}.tar", id))
  }

  fn record_path(&self, id: &PlanId) -> PathBuf {
    self.root.join("meta").join(format!("{}.json", id))
  }

  fn temp_path(&self, label: &str) -> PathBuf {
    let n = self.counter.fetch_add(1, Ordering::SeqCst);
    self
      .root
      .join("tmp")
      .join(format!("{}.{}.{}.partial", label, std::process::id(), n))
  }

  /// Write `bytes` to a temporary file then rename it over `dest`.
  async fn write_atomic(&self, dest: &Path, label: &str, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = self.temp_path(label);
    let result = async {
      let mut file = tokio::fs::File::create(&tmp).await.map_err(io_error(&tmp))?;
      file.write_all(bytes).await.map_err(io_error(&tmp))?;
      file.sync_all().await.map_err(io_error(&tmp))?;
      drop(file);
      tokio::fs::rename(&tmp, dest).await.map_err(io_error(dest))
    }
    .await;

    if result.is_err() {
      let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
  }

  async fn read_record(&self, id: &PlanId) -> Result<Option<ArtifactRecord>, StoreError> {
    let path = self.record_path(id);
    let content = match tokio::fs::read(&path).await {
      Ok(content) => content,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(io_error(&path)(e)),
    };
    let record: ArtifactRecord = serde_json::from_slice(&content).map_err(|e| StoreError::Metadata {
      id: id.clone(),
      message: e.to_string(),
    })?;
    if record.version != RECORD_VERSION || &record.id != id {
      return Err(StoreError::Metadata {
        id: id.clone(),
        message: format!("unexpected record (version {}, id {})", record.version, record.id),
      });
    }
    Ok(Some(record))
  }

  /// Drop a record whose object is missing or damaged so the identity can be
  /// rebuilt.
  async fn evict(&self, id: &PlanId) {
    warn!(id = %id, "evicting damaged store entry");
    let _ = tokio::fs::remove_file(self.record_path(id)).await;
    let _ = tokio::fs::remove_file(self.object_path(id)).await;
  }

  fn artifact(&self, record: ArtifactRecord) -> Artifact {
    let path = self.object_path(&record.id);
    Artifact {
      id: record.id,
      digest: record.digest,
      size: record.size,
      path: Some(path),
    }
  }
}

#[async_trait]
impl ContentStore for FsStore {
  async fn has(&self, id: &PlanId) -> Result<bool, StoreError> {
    Ok(self.get(id).await?.is_some())
  }

  async fn put(&self, id: &PlanId, bytes: Vec<u8>) -> Result<Artifact, StoreError> {
    let digest = hash_bytes(&bytes);

    if let Some(existing) = self.get(id).await? {
      if existing.digest != digest {
        warn!(
          id = %id,
          stored = %existing.digest,
          offered = %digest,
          "artifact already stored with different bytes, keeping the stored one"
        );
      }
      return Ok(existing);
    }

    let record = ArtifactRecord {
      version: RECORD_VERSION,
      id: id.clone(),
      digest,
      size: bytes.len() as u64,
    };
    let record_json = serde_json::to_vec_pretty(&record).map_err(|e| StoreError::Metadata {
      id: id.clone(),
      message: e.to_string(),
    })?;

    self.write_atomic(&self.object_path(id), id.short(), &bytes).await?;
    self.write_atomic(&self.record_path(id), id.short(), &record_json).await?;

    info!(id = %id.short(), digest = %record.digest.short(), size = record.size, "stored artifact");
    Ok(self.artifact(record))
  }

  async fn get(&self, id: &PlanId) -> Result<Option<Artifact>, StoreError> {
    let record = match self.read_record(id).await {
      Ok(Some(record)) => record,
      Ok(None) => return Ok(None),
      Err(StoreError::Metadata { message, .. }) => {
        debug!(id = %id, error = %message, "invalid record");
        self.evict(id).await;
        return Ok(None);
      }
      Err(e) => return Err(e),
    };

    let object = self.object_path(id);
    match tokio::fs::metadata(&object).await {
      Ok(meta) if meta.len() == record.size => Ok(Some(self.artifact(record))),
      Ok(_) | Err(_) => {
        self.evict(id).await;
        Ok(None)
      }
    }
  }

  async fn read(&self, id: &PlanId) -> Result<Option<Vec<u8>>, StoreError> {
    let Some(artifact) = self.get(id).await? else {
      return Ok(None);
    };

    let object = self.object_path(id);
    let bytes = tokio::fs::read(&object).await.map_err(io_error(&object))?;
    let actual = hash_bytes(&bytes);
    if actual != artifact.digest {
      self.evict(id).await;
      return Err(StoreError::Corrupt {
        id: id.clone(),
        expected: artifact.digest,
        actual,
      });
    }
    Ok(Some(bytes))
  }

  fn scratch_dir(&self) -> Option<PathBuf> {
    Some(self.root.join("tmp"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;
  use tempfile::TempDir;

  fn id(seed: &str) -> PlanId {
    PlanId(hash_bytes(seed.as_bytes()))
  }

  #[tokio::test]
  async fn put_then_get_and_read() {
    let temp = TempDir::new().unwrap();
    let store = FsStore::open(temp.path()).await.unwrap();

    assert!(!store.has(&id("a")).await.unwrap());
    let artifact = store.put(&id("a"), b"payload".to_vec()).await.unwrap();

    assert_eq!(artifact.digest, hash_bytes(b"payload"));
    assert_eq!(artifact.size, 7);
    assert_eq!(artifact.path.as_deref(), Some(store.object_path(&id("a")).as_path()));
    assert!(store.has(&id("a")).await.unwrap());
    assert_eq!(store.get(&id("a")).await.unwrap(), Some(artifact));
    assert_eq!(store.read(&id("a")).await.unwrap().unwrap(), b"payload");
  }

  #[tokio::test]
  async fn put_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let store = FsStore::open(temp.path()).await.unwrap();

    let first = store.put(&id("a"), b"one".to_vec()).await.unwrap();
    let second = store.put(&id("a"), b"two".to_vec()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(store.read(&id("a")).await.unwrap().unwrap(), b"one");
  }

  #[tokio::test]
  async fn no_partial_files_remain() {
    let temp = TempDir::new().unwrap();
    let store = FsStore::open(temp.path()).await.unwrap();
    store.put(&id("a"), b"x".to_vec()).await.unwrap();

    let leftovers = std::fs::read_dir(temp.path().join("tmp")).unwrap().count();
    assert_eq!(leftovers, 0);
  }

  #[tokio::test]
  async fn object_without_record_is_not_visible() {
    let temp = TempDir::new().unwrap();
    let store = FsStore::open(temp.path()).await.unwrap();
    std::fs::write(store.object_path(&id("a")), b"orphan").unwrap();
    assert!(store.get(&id("a")).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn truncated_object_is_evicted() {
    let temp = TempDir::new().unwrap();
    let store = FsStore::open(temp.path()).await.unwrap();
    store.put(&id("a"), b"full content".to_vec()).await.unwrap();
    std::fs::write(store.object_path(&id("a")), b"full").unwrap();

    assert!(store.get(&id("a")).await.unwrap().is_none());
    assert!(!store.record_path(&id("a")).exists());
  }

  #[tokio::test]
  async fn tampered_object_is_corrupt_on_read() {
    let temp = TempDir::new().unwrap();
    let store = FsStore::open(temp.path()).await.unwrap();
    store.put(&id("a"), b"content".to_vec()).await.unwrap();
    std::fs::write(store.object_path(&id("a")), b"CONTENT").unwrap();

    let err = store.read(&id("a")).await.unwrap_err();
    assert!(matches!(err, StoreError::Corrupt { .. }));
    assert!(!store.has(&id("a")).await.unwrap());
  }

  #[tokio::test]
  async fn garbage_record_is_treated_as_absent() {
    let temp = TempDir::new().unwrap();
    let store = FsStore::open(temp.path()).await.unwrap();
    std::fs::write(store.record_path(&id("a")), b"{not json").unwrap();
    assert!(store.get(&id("a")).await.unwrap().is_none());
  }

  #[test]
  #[serial]
  fn open_default_uses_store_env() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("custom");
    temp_env::with_var(crate::consts::STORE_ENV, Some(root.to_str().unwrap()), || {
      let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
      let store = rt.block_on(FsStore::open_default()).unwrap();
      assert_eq!(store.root(), root);
      assert!(root.join("objects").is_dir());
    });
  }
}
