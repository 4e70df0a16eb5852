//! In-memory content store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Artifact, ContentStore, StoreError};
use crate::plan::PlanId;
use crate::util::hash::hash_bytes;

/// Keeps artifacts in a map. Counts the writes that actually stored bytes.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<PlanId, (Artifact, Vec<u8>)>>,
  writes: AtomicUsize,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of `put` calls that stored a new artifact.
  pub fn writes(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  pub fn len(&self) -> usize {
    self.entries.lock().map(|e| e.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PlanId, (Artifact, Vec<u8>)>>, StoreError> {
    self.entries.lock().map_err(|_| StoreError::Io {
      path: "<memory>".into(),
      source: std::io::Error::other("store state poisoned"),
    })
  }
}

#[async_trait]
impl ContentStore for MemoryStore {
  async fn has(&self, id: &PlanId) -> Result<bool, StoreError> {
    Ok(self.lock()?.contains_key(id))
  }

  async fn put(&self, id: &PlanId, bytes: Vec<u8>) -> Result<Artifact, StoreError> {
    let mut entries = self.lock()?;
    if let Some((existing, _)) = entries.get(id) {
      return Ok(existing.clone());
    }
    let artifact = Artifact {
      id: id.clone(),
      digest: hash_bytes(&bytes),
      size: bytes.len() as u64,
      path: None,
    };
    entries.insert(id.clone(), (artifact.clone(), bytes));
    self.writes.fetch_add(1, Ordering::SeqCst);
    Ok(artifact)
  }

  async fn get(&self, id: &PlanId) -> Result<Option<Artifact>, StoreError> {
    Ok(self.lock()?.get(id).map(|(artifact, _)| artifact.clone()))
  }

  async fn read(&self, id: &PlanId) -> Result<Option<Vec<u8>>, StoreError> {
    Ok(self.lock()?.get(id).map(|(_, bytes)| bytes.clone()))
  }
}
