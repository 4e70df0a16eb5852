//! Test helpers for overlay-lib.
//!
//! Fixture packages, in-memory archives, tree digests and cross-platform
//! shell commands.

use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use walkdir::WalkDir;

use crate::package::{PackageDefinition, Recipe, SourceDescriptor, ToolCommand};
use crate::util::hash::{ContentHash, hash_bytes};

/// Bytes used as the source of [`simple_package`].
pub fn source_bytes(name: &str) -> Vec<u8> {
  format!("{} source\n", name).into_bytes()
}

/// A package with a single-file source, no patches, options or dependencies.
pub fn simple_package(name: &str) -> PackageDefinition {
  let source = SourceDescriptor::new(&format!("file:///sources/{}.txt", name), hash_bytes(&source_bytes(name)));
  PackageDefinition::new(name, "1.0", source, Recipe::new(shell_cmd("true"), shell_cmd("true")))
}

/// Shell command running `script`.
#[cfg(unix)]
pub fn shell_cmd(script: &str) -> ToolCommand {
  ToolCommand::new("/bin/sh").arg("-c").arg(script)
}

#[cfg(windows)]
pub fn shell_cmd(script: &str) -> ToolCommand {
  ToolCommand::new("cmd.exe").arg("/C").arg(script)
}

/// An uncompressed tar holding `entries` as regular files.
pub fn tar_of(entries: &[(&str, &str)]) -> Vec<u8> {
  let mut builder = tar::Builder::new(Vec::new());
  for (path, content) in entries {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, content.as_bytes()).unwrap();
  }
  builder.into_inner().unwrap()
}

/// A gzip-compressed tar holding `entries`.
pub fn tar_gz_of(entries: &[(&str, &str)]) -> Vec<u8> {
  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(&tar_of(entries)).unwrap();
  encoder.finish().unwrap()
}

/// Digest of a directory's structure, file contents and symlink targets.
///
/// Timestamps and permissions are not covered.
pub fn tree_digest(root: &Path) -> ContentHash {
  let mut listing = String::new();
  for entry in WalkDir::new(root).sort_by_file_name() {
    let entry = entry.unwrap();
    let rel = entry.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
    if rel.is_empty() {
      continue;
    }
    let kind = entry.file_type();
    if kind.is_file() {
      listing.push_str(&format!("F:{}:{}\n", rel, hash_bytes(&fs::read(entry.path()).unwrap())));
    } else if kind.is_dir() {
      listing.push_str(&format!("D:{}\n", rel));
    } else if kind.is_symlink() {
      let target = fs::read_link(entry.path()).unwrap();
      listing.push_str(&format!("L:{}:{}\n", rel, target.to_string_lossy()));
    }
  }
  hash_bytes(listing.as_bytes())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn tree_digest_tracks_content_and_layout() {
    let flat = tempdir().unwrap();
    fs::write(flat.path().join("file.txt"), "content").unwrap();
    let nested = tempdir().unwrap();
    fs::create_dir(nested.path().join("sub")).unwrap();
    fs::write(nested.path().join("sub/file.txt"), "content").unwrap();

    let before = tree_digest(flat.path());
    assert_eq!(tree_digest(flat.path()), before);
    assert_ne!(tree_digest(nested.path()), before);

    fs::write(flat.path().join("file.txt"), "changed").unwrap();
    assert_ne!(tree_digest(flat.path()), before);
  }
}
