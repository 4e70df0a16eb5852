//! Hashing utilities for content addressing and verification.
//!
//! This module provides:
//! - `ContentHash`: a full 64-character SHA-256 digest
//! - `Hashable`: identity hashing of serializable values
//! - `hash_bytes()`: content digests

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consts::{SHA256_HEX_LEN, SHORT_HASH_LEN};

pub type HashError = serde_json::Error;

/// A SHA-256 digest in lowercase hexadecimal.
///
/// Used for pinned source digests, patch digests, artifact digests and plan
/// identities alike.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
  /// Parse a digest, accepting upper-case input and an optional `sha256:` prefix.
  pub fn parse(s: &str) -> Result<Self, InvalidDigest> {
    let hex = s.strip_prefix("sha256:").unwrap_or(s).to_ascii_lowercase();
    if hex.len() != SHA256_HEX_LEN || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
      return Err(InvalidDigest(s.to_string()));
    }
    Ok(ContentHash(hex))
  }

  /// Whether this value is a well-formed SHA-256 digest.
  pub fn is_valid(&self) -> bool {
    self.0.len() == SHA256_HEX_LEN && self.0.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
  }

  /// Leading characters of the digest, for display.
  pub fn short(&self) -> &str {
    let len = self.0.len().min(SHORT_HASH_LEN);
    &self.0[..len]
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sha256 digest: {0:?}")]
pub struct InvalidDigest(pub String);

/// Values whose identity is the SHA-256 of their JSON serialization.
///
/// Implementors must serialize deterministically: maps are `BTreeMap`s and
/// sets are `BTreeSet`s.
pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ContentHash, HashError> {
    let serialized = serde_json::to_vec(self)?;
    Ok(hash_bytes(&serialized))
  }
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hash_bytes_known_value() {
    assert_eq!(
      hash_bytes(b"hello").0,
      "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
  }

  #[test]
  fn parse_accepts_prefix_and_uppercase() {
    let lower = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    let parsed = ContentHash::parse(&format!("sha256:{}", lower.to_uppercase())).unwrap();
    assert_eq!(parsed.0, lower);
    assert!(parsed.is_valid());
  }

  #[test]
  fn parse_rejects_malformed() {
    assert!(ContentHash::parse("abc123").is_err());
    assert!(ContentHash::parse(&"z".repeat(64)).is_err());
    assert!(!ContentHash("abc".to_string()).is_valid());
  }

  #[test]
  fn short_is_truncated() {
    let hash = hash_bytes(b"x");
    assert_eq!(hash.short().len(), SHORT_HASH_LEN);
    assert!(hash.0.starts_with(hash.short()));
  }

  #[derive(Serialize)]
  struct Sample {
    name: &'static str,
  }

  impl Hashable for Sample {}

  #[test]
  fn hashable_depends_on_fields() {
    let a = Sample { name: "a" }.compute_hash().unwrap();
    let b = Sample { name: "b" }.compute_hash().unwrap();
    assert_ne!(a, b);
    assert!(a.is_valid());
  }
}
