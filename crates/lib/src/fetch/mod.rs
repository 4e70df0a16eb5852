//! Source retrieval with digest verification.
//!
//! The [`FetchVerifier`] retrieves bytes through a [`Transport`], hashes them
//! and compares the result against the pinned digest. Bytes that fail the
//! check are dropped; nothing unverified leaves this module. Sub-modules are
//! fetched and verified independently of their parent.

mod transport;
mod unpack;

use std::path::Path;
use std::sync::Arc;

use futures::future::try_join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::package::{SourceDescriptor, Unpack};
use crate::util::hash::{ContentHash, hash_bytes};

pub use transport::{DefaultTransport, FileTransport, HttpTransport, MemoryTransport, Transport, TransportError};

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("hash mismatch for {origin}: expected {expected}, got {actual}")]
  HashMismatch {
    origin: String,
    expected: ContentHash,
    actual: ContentHash,
  },

  #[error("failed to retrieve {origin}: {source}")]
  Transport {
    origin: String,
    #[source]
    source: TransportError,
  },

  #[error("failed to unpack {origin}: {message}")]
  Unpack { origin: String, message: String },
}

/// Verified bytes for one source or sub-module.
#[derive(Debug, Clone)]
pub struct VerifiedBlob {
  pub origin: String,
  pub digest: ContentHash,
  pub unpack: Unpack,
  bytes: Arc<Vec<u8>>,
}

impl VerifiedBlob {
  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }
}

/// A source whose bytes, and the bytes of every sub-module, matched their
/// pinned digests.
#[derive(Debug, Clone)]
pub struct VerifiedSource {
  pub root: VerifiedBlob,
  /// Sub-modules keyed by mount path relative to the tree root, parents
  /// before their own sub-modules.
  pub submodules: Vec<(String, VerifiedBlob)>,
}

impl VerifiedSource {
  /// Unpack the source into `dest` and mount every sub-module at its path.
  ///
  /// # Errors
  ///
  /// [`FetchError::Unpack`] if an archive is malformed or an entry would land
  /// outside `dest`.
  pub fn materialize(&self, dest: &Path) -> Result<(), FetchError> {
    unpack::unpack_into(&self.root.origin, self.root.bytes(), self.root.unpack, dest)?;
    for (path, blob) in &self.submodules {
      if !crate::plan::is_contained_path(path) {
        return Err(FetchError::Unpack {
          origin: blob.origin.clone(),
          message: format!("mount path '{}' escapes the source tree", path),
        });
      }
      unpack::unpack_into(&blob.origin, blob.bytes(), blob.unpack, &dest.join(path))?;
    }
    Ok(())
  }
}

/// Fetches sources and verifies them against their pinned digests.
#[derive(Clone)]
pub struct FetchVerifier {
  transport: Arc<dyn Transport>,
}

impl FetchVerifier {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self { transport }
  }

  /// Retrieve and verify `source` and all of its sub-modules.
  ///
  /// Sub-modules are retrieved concurrently. The first failure wins.
  ///
  /// # Errors
  ///
  /// - [`FetchError::HashMismatch`] if any retrieved bytes do not hash to the
  ///   pinned digest
  /// - [`FetchError::Transport`] if retrieval fails
  pub async fn fetch(&self, source: &SourceDescriptor) -> Result<VerifiedSource, FetchError> {
    let mut pending = Vec::new();
    flatten_submodules(source, "", &mut pending);

    let submodules = try_join_all(pending.into_iter().map(|(path, desc)| async move {
      let blob = self.fetch_one(desc).await?;
      Ok::<_, FetchError>((path, blob))
    }));
    let (root, submodules) = futures::try_join!(self.fetch_one(source), submodules)?;

    info!(
      origin = %root.origin,
      submodules = submodules.len(),
      "source verified"
    );

    Ok(VerifiedSource { root, submodules })
  }

  async fn fetch_one(&self, desc: &SourceDescriptor) -> Result<VerifiedBlob, FetchError> {
    debug!(origin = %desc.origin, expected = %desc.sha256.short(), "retrieving source");

    let bytes = self
      .transport
      .retrieve(&desc.origin)
      .await
      .map_err(|source| FetchError::Transport {
        origin: desc.origin.clone(),
        source,
      })?;

    let actual = hash_bytes(&bytes);
    if actual != desc.sha256 {
      warn!(origin = %desc.origin, expected = %desc.sha256, actual = %actual, "source digest mismatch");
      return Err(FetchError::HashMismatch {
        origin: desc.origin.clone(),
        expected: desc.sha256.clone(),
        actual,
      });
    }

    Ok(VerifiedBlob {
      origin: desc.origin.clone(),
      digest: actual,
      unpack: desc.unpack,
      bytes: Arc::new(bytes),
    })
  }
}

impl std::fmt::Debug for FetchVerifier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FetchVerifier").finish_non_exhaustive()
  }
}

fn flatten_submodules<'a>(source: &'a SourceDescriptor, prefix: &str, out: &mut Vec<(String, &'a SourceDescriptor)>) {
  for (path, sub) in &source.submodules {
    let nested = if prefix.is_empty() {
      path.clone()
    } else {
      format!("{}/{}", prefix, path)
    };
    out.push((nested.clone(), sub));
    flatten_submodules(sub, &nested, out);
  }
}
