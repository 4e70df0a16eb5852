//! Patch application.
//!
//! Patches are applied strictly in the order given, each against the tree
//! left by the one before it. The whole list is applied to a staging copy
//! that replaces the tree only once every patch has succeeded, so a failed
//! list leaves the tree exactly as it was.

mod diff;

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::package::PatchDescriptor;
use diff::{FilePatch, Text};

#[derive(Debug, Error)]
pub enum PatchError {
  /// The patch at `index` in the applied list could not be applied.
  #[error("patch #{index} ('{name}') does not apply: {reason}")]
  PatchConflict { index: usize, name: String, reason: String },

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PatchError + '_ {
  move |source| PatchError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Applies ordered lists of unified diffs to a source tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchApplier;

impl PatchApplier {
  pub fn new() -> Self {
    Self
  }

  /// Apply `patches` to the tree at `tree`, in order.
  ///
  /// # Errors
  ///
  /// - [`PatchError::PatchConflict`] naming the first patch that fails; the
  ///   tree is left unmodified
  /// - [`PatchError::Io`] if the staging copy cannot be made or swapped in
  pub fn apply(&self, tree: &Path, patches: &[PatchDescriptor]) -> Result<(), PatchError> {
    if patches.is_empty() {
      return Ok(());
    }

    let parent = tree.parent().unwrap_or(Path::new("."));
    let scratch = tempfile::Builder::new()
      .prefix(".patch-")
      .tempdir_in(parent)
      .map_err(io_error(parent))?;
    let staging = scratch.path().join("tree");
    copy_tree(tree, &staging)?;

    for (index, patch) in patches.iter().enumerate() {
      debug!(index, name = %patch.name, "applying patch");
      apply_one(&staging, patch).map_err(|reason| PatchError::PatchConflict {
        index,
        name: patch.name.clone(),
        reason,
      })?;
    }

    let previous = scratch.path().join("previous");
    fs::rename(tree, &previous).map_err(io_error(tree))?;
    if let Err(source) = fs::rename(&staging, tree) {
      let _ = fs::rename(&previous, tree);
      return Err(PatchError::Io {
        path: tree.to_path_buf(),
        source,
      });
    }

    info!(tree = ?tree, count = patches.len(), "patches applied");
    Ok(())
  }
}

fn apply_one(root: &Path, patch: &PatchDescriptor) -> Result<(), String> {
  let files = diff::parse(&patch.diff).map_err(|e| format!("malformed diff: {}", e))?;
  for file in &files {
    apply_file(root, file)?;
  }
  Ok(())
}

fn apply_file(root: &Path, file: &FilePatch) -> Result<(), String> {
  let rel = file.target().ok_or("patch has no target path")?;
  if !crate::plan::is_contained_path(rel) {
    return Err(format!("path '{}' escapes the source tree", rel));
  }
  let path = root.join(rel);

  let original = if file.creates() {
    if path.exists() {
      return Err(format!("{} already exists", rel));
    }
    Text::empty()
  } else {
    let bytes = fs::read(&path).map_err(|e| format!("cannot read {}: {}", rel, e))?;
    let content = String::from_utf8(bytes).map_err(|_| format!("{} is not valid UTF-8", rel))?;
    Text::parse(&content)
  };

  let patched = diff::apply_hunks(&original, &file.hunks).map_err(|e| format!("{}: {}", rel, e))?;

  if file.deletes() {
    if !patched.lines.is_empty() {
      return Err(format!("{} is not empty after removing its content", rel));
    }
    return fs::remove_file(&path).map_err(|e| format!("cannot remove {}: {}", rel, e));
  }

  if let Some(dir) = path.parent() {
    fs::create_dir_all(dir).map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
  }
  fs::write(&path, patched.render()).map_err(|e| format!("cannot write {}: {}", rel, e))
}

/// Recursively copy `src` to `dst`, preserving symlinks and permissions.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<(), PatchError> {
  for entry in WalkDir::new(src).sort_by_file_name() {
    let entry = entry.map_err(|e| PatchError::Io {
      path: src.to_path_buf(),
      source: e.into(),
    })?;
    let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
    let target = dst.join(rel);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      fs::create_dir_all(&target).map_err(io_error(&target))?;
    } else if file_type.is_symlink() {
      let link = fs::read_link(entry.path()).map_err(io_error(entry.path()))?;
      symlink(&link, &target).map_err(io_error(&target))?;
    } else {
      fs::copy(entry.path(), &target).map_err(io_error(&target))?;
    }
  }
  Ok(())
}

#[cfg(unix)]
fn symlink(link: &Path, target: &Path) -> std::io::Result<()> {
  std::os::unix::fs::symlink(link, target)
}

#[cfg(windows)]
fn symlink(link: &Path, target: &Path) -> std::io::Result<()> {
  std::os::windows::fs::symlink_file(link, target)
}
