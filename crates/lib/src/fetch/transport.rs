//! Byte retrieval from source origins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("unsupported origin scheme: {0}")]
  UnsupportedScheme(String),

  #[error("request failed: {0}")]
  Request(String),

  #[error("HTTP {0}")]
  Status(u16),

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("no such origin: {0}")]
  NotFound(String),
}

/// Retrieves the raw bytes behind an origin.
///
/// Implementations perform no verification; the caller checks digests.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn retrieve(&self, origin: &str) -> Result<Vec<u8>, TransportError>;
}

/// `http://` and `https://` origins.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn retrieve(&self, origin: &str) -> Result<Vec<u8>, TransportError> {
    info!(url = %origin, "fetching URL");

    let response = self
      .client
      .get(origin)
      .send()
      .await
      .map_err(|e| TransportError::Request(e.to_string()))?;

    if !response.status().is_success() {
      return Err(TransportError::Status(response.status().as_u16()));
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| TransportError::Request(e.to_string()))?;

    debug!(url = %origin, size = bytes.len(), "download complete");
    Ok(bytes.to_vec())
  }
}

/// `file://` URLs and plain filesystem paths.
///
/// Relative paths resolve against `base` when one is set, otherwise against
/// the current directory.
#[derive(Debug, Clone, Default)]
pub struct FileTransport {
  base: Option<PathBuf>,
}

impl FileTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_base(base: &Path) -> Self {
    Self {
      base: Some(base.to_path_buf()),
    }
  }

  fn resolve(&self, origin: &str) -> PathBuf {
    let raw = origin.strip_prefix("file://").unwrap_or(origin);
    let path = PathBuf::from(raw);
    match &self.base {
      Some(base) if path.is_relative() => base.join(path),
      _ => path,
    }
  }
}

#[async_trait]
impl Transport for FileTransport {
  async fn retrieve(&self, origin: &str) -> Result<Vec<u8>, TransportError> {
    let path = self.resolve(origin);
    debug!(path = ?path, "reading local source");
    tokio::fs::read(&path)
      .await
      .map_err(|source| TransportError::Read { path, source })
  }
}

/// Dispatches on the origin's scheme: HTTP(S) to [`HttpTransport`],
/// everything without a scheme or with `file://` to [`FileTransport`].
#[derive(Debug, Clone, Default)]
pub struct DefaultTransport {
  http: HttpTransport,
  file: FileTransport,
}

impl DefaultTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_base(base: &Path) -> Self {
    Self {
      http: HttpTransport::new(),
      file: FileTransport::with_base(base),
    }
  }
}

#[async_trait]
impl Transport for DefaultTransport {
  async fn retrieve(&self, origin: &str) -> Result<Vec<u8>, TransportError> {
    match origin.split_once("://").map(|(scheme, _)| scheme) {
      Some("http") | Some("https") => self.http.retrieve(origin).await,
      Some("file") | None => self.file.retrieve(origin).await,
      Some(other) => Err(TransportError::UnsupportedScheme(other.to_string())),
    }
  }
}

/// Serves bytes registered up front and counts retrievals.
#[derive(Debug, Default)]
pub struct MemoryTransport {
  objects: Mutex<HashMap<String, Vec<u8>>>,
  retrievals: AtomicUsize,
}

impl MemoryTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(self, origin: &str, bytes: impl Into<Vec<u8>>) -> Self {
    self.insert(origin, bytes);
    self
  }

  pub fn insert(&self, origin: &str, bytes: impl Into<Vec<u8>>) {
    if let Ok(mut objects) = self.objects.lock() {
      objects.insert(origin.to_string(), bytes.into());
    }
  }

  pub fn retrievals(&self) -> usize {
    self.retrievals.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Transport for MemoryTransport {
  async fn retrieve(&self, origin: &str) -> Result<Vec<u8>, TransportError> {
    self.retrievals.fetch_add(1, Ordering::SeqCst);
    let objects = self
      .objects
      .lock()
      .map_err(|_| TransportError::Request("transport state poisoned".to_string()))?;
    objects
      .get(origin)
      .cloned()
      .ok_or_else(|| TransportError::NotFound(origin.to_string()))
  }
}
