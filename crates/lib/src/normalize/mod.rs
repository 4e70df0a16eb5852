//! Output normalization.
//!
//! Build tools embed timestamps and similar non-deterministic strings into
//! their outputs. Before an install tree is packed, every file is passed
//! through the normalizers registered for its type so that two builds of the
//! same plan produce identical bytes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::bytes::Regex;
use thiserror::Error;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Key matching every output type.
pub const ANY_TYPE: &str = "*";

/// Passes allowed beyond the input length before a rewrite chain is
/// considered divergent.
const EXTRA_PASSES: usize = 16;

#[derive(Debug, Error)]
pub enum NormalizeError {
  #[error("invalid pattern {pattern:?}: {message}")]
  InvalidPattern { pattern: String, message: String },

  #[error("pattern {0:?} matches the empty string")]
  EmptyMatch(String),

  #[error("{normalizer} did not reach a fixed point after {passes} passes")]
  Divergent { normalizer: String, passes: usize },

  #[error("failed to normalize {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Rewrites output bytes into a canonical form.
///
/// Implementations must be idempotent: normalizing already normalized bytes
/// returns them unchanged. An implementation that cannot guarantee this for
/// some input returns an error instead of a partially normalized result.
pub trait Normalizer: Send + Sync {
  fn name(&self) -> &str;

  fn normalize(&self, input: &[u8]) -> Result<Vec<u8>, NormalizeError>;
}

/// Apply `pass` until its output stops changing.
///
/// Fails when the output keeps growing past the larger of the input and the
/// first pass, or when the pass count exceeds that size plus
/// [`EXTRA_PASSES`].
fn fixed_point<F>(name: &str, input: &[u8], pass: F) -> Result<Vec<u8>, NormalizeError>
where
  F: Fn(&[u8]) -> Result<Vec<u8>, NormalizeError>,
{
  let mut current = pass(input)?;
  let ceiling = input.len().max(current.len());
  let limit = ceiling + EXTRA_PASSES;

  for _ in 0..limit {
    let next = pass(&current)?;
    if next == current {
      return Ok(current);
    }
    if next.len() > ceiling {
      break;
    }
    current = next;
  }

  Err(NormalizeError::Divergent {
    normalizer: name.to_string(),
    passes: limit,
  })
}

#[derive(Debug, Clone)]
struct Rule {
  pattern: Regex,
  replacement: Vec<u8>,
}

/// Ordered regular-expression replacements, repeated until the output stops
/// changing.
#[derive(Debug, Clone)]
pub struct PatternNormalizer {
  name: String,
  rules: Vec<Rule>,
}

impl PatternNormalizer {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      rules: Vec::new(),
    }
  }

  /// Add a rule. `replacement` may refer to capture groups as `$1` or
  /// `${name}`. Patterns that match the empty string are rejected.
  pub fn rule(mut self, pattern: &str, replacement: &str) -> Result<Self, NormalizeError> {
    let compiled = Regex::new(pattern).map_err(|e| NormalizeError::InvalidPattern {
      pattern: pattern.to_string(),
      message: e.to_string(),
    })?;
    if compiled.is_match(b"") {
      return Err(NormalizeError::EmptyMatch(pattern.to_string()));
    }
    self.rules.push(Rule {
      pattern: compiled,
      replacement: replacement.as_bytes().to_vec(),
    });
    Ok(self)
  }

  /// Timestamps, `Generated on` banners and mail-style `Date:` headers,
  /// each rewritten to the reproducible epoch.
  pub fn timestamps() -> Result<Self, NormalizeError> {
    Self::new("timestamps")
      .rule(
        r"(?m)^Date: [A-Z][a-z]{2}, \d{1,2} [A-Z][a-z]{2} \d{4} \d{2}:\d{2}:\d{2} [+-]\d{4}",
        "Date: Tue, 01 Jan 1980 00:00:00 +0000",
      )?
      .rule(
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
        "1980-01-01T00:00:00Z",
      )?
      .rule(r"(?i)(generated (?:on|at):? )[^\r\n]*", "${1}1980-01-01")
  }
}

impl Normalizer for PatternNormalizer {
  fn name(&self) -> &str {
    &self.name
  }

  fn normalize(&self, input: &[u8]) -> Result<Vec<u8>, NormalizeError> {
    fixed_point(&self.name, input, |bytes| {
      let mut next = bytes.to_vec();
      for rule in &self.rules {
        next = rule.pattern.replace_all(&next, rule.replacement.as_slice()).into_owned();
      }
      Ok(next)
    })
  }
}

/// Normalizers keyed by output type: a file extension without the dot, or
/// [`ANY_TYPE`].
#[derive(Clone, Default)]
pub struct NormalizerSet {
  by_type: BTreeMap<String, Vec<Arc<dyn Normalizer>>>,
}

impl NormalizerSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Timestamp normalization for every output type.
  pub fn standard() -> Result<Self, NormalizeError> {
    Ok(Self::new().register(ANY_TYPE, Arc::new(PatternNormalizer::timestamps()?)))
  }

  pub fn register(mut self, output_type: &str, normalizer: Arc<dyn Normalizer>) -> Self {
    self
      .by_type
      .entry(output_type.to_string())
      .or_default()
      .push(normalizer);
    self
  }

  /// Normalizers applying to `path`: the catch-all ones first, then those for
  /// its extension.
  pub fn for_path(&self, path: &Path) -> Vec<Arc<dyn Normalizer>> {
    let mut out: Vec<Arc<dyn Normalizer>> = self.by_type.get(ANY_TYPE).cloned().unwrap_or_default();
    if let Some(ext) = path.extension().and_then(|e| e.to_str())
      && let Some(specific) = self.by_type.get(ext)
    {
      out.extend(specific.iter().cloned());
    }
    out
  }

  /// Run the normalizers for `path` in order, repeating the whole chain
  /// until it leaves the bytes unchanged. A later normalizer may produce text
  /// an earlier one rewrites.
  pub fn normalize_bytes(&self, path: &Path, input: &[u8]) -> Result<Vec<u8>, NormalizeError> {
    let chain = self.for_path(path);
    if chain.is_empty() {
      return Ok(input.to_vec());
    }
    fixed_point(&path.display().to_string(), input, |bytes| {
      chain
        .iter()
        .try_fold(bytes.to_vec(), |current, normalizer| normalizer.normalize(&current))
    })
  }

  /// Normalize every regular file under `root` in place.
  ///
  /// Files containing NUL bytes are treated as binary and skipped. Returns
  /// the number of files rewritten.
  pub fn normalize_tree(&self, root: &Path) -> Result<usize, NormalizeError> {
    let mut rewritten = 0;

    for entry in WalkDir::new(root).sort_by_file_name() {
      let entry = entry.map_err(|e| NormalizeError::Io {
        path: root.to_path_buf(),
        source: e.into(),
      })?;
      if !entry.file_type().is_file() {
        continue;
      }

      let path = entry.path();
      let io = |source| NormalizeError::Io {
        path: path.to_path_buf(),
        source,
      };
      let original = std::fs::read(path).map_err(io)?;
      if original.contains(&0) {
        trace!(path = ?path, "skipping binary file");
        continue;
      }

      let normalized = self.normalize_bytes(path, &original)?;
      if normalized != original {
        std::fs::write(path, &normalized).map_err(io)?;
        rewritten += 1;
      }
    }

    debug!(root = ?root, rewritten, "normalized outputs");
    Ok(rewritten)
  }
}

impl std::fmt::Debug for NormalizerSet {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let names: BTreeMap<&str, Vec<&str>> = self
      .by_type
      .iter()
      .map(|(k, v)| (k.as_str(), v.iter().map(|n| n.name()).collect()))
      .collect();
    f.debug_struct("NormalizerSet").field("by_type", &names).finish()
  }
}
