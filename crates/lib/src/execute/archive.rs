//! Deterministic packing of install trees.
//!
//! Entries are written in sorted path order with fixed ownership, fixed
//! modification times and permissions reduced to executable or not, so the
//! bytes depend only on the tree's content.

use std::io;
use std::path::Path;

use walkdir::WalkDir;

use crate::consts::SOURCE_DATE_EPOCH;

fn epoch() -> u64 {
  SOURCE_DATE_EPOCH.parse().unwrap_or(0)
}

fn header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
  let mut header = tar::Header::new_gnu();
  header.set_entry_type(entry_type);
  header.set_mode(mode);
  header.set_size(size);
  header.set_mtime(epoch());
  header.set_uid(0);
  header.set_gid(0);
  header
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
  false
}

/// Pack the tree at `root` into an uncompressed tar.
pub fn pack_tree(root: &Path) -> io::Result<Vec<u8>> {
  let mut builder = tar::Builder::new(Vec::new());

  for entry in WalkDir::new(root).sort_by_file_name().follow_links(false) {
    let entry = entry.map_err(io::Error::from)?;
    let rel = match entry.path().strip_prefix(root) {
      Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
      _ => continue,
    };
    let file_type = entry.file_type();

    if file_type.is_dir() {
      let mut h = header(tar::EntryType::Directory, 0o755, 0);
      builder.append_data(&mut h, &rel, io::empty())?;
    } else if file_type.is_symlink() {
      let target = std::fs::read_link(entry.path())?;
      let mut h = header(tar::EntryType::Symlink, 0o777, 0);
      builder.append_link(&mut h, &rel, &target)?;
    } else if file_type.is_file() {
      let meta = entry.metadata().map_err(io::Error::from)?;
      let mode = if is_executable(&meta) { 0o755 } else { 0o644 };
      let mut h = header(tar::EntryType::Regular, mode, meta.len());
      let file = std::fs::File::open(entry.path())?;
      builder.append_data(&mut h, &rel, file)?;
    }
  }

  builder.into_inner()
}

/// Unpack an archive produced by [`pack_tree`] into `dest`.
pub fn unpack_archive(bytes: &[u8], dest: &Path) -> io::Result<()> {
  std::fs::create_dir_all(dest)?;
  let mut archive = tar::Archive::new(bytes);
  archive.set_preserve_mtime(false);
  archive.unpack(dest)
}
