//! Turning verified bytes into a source tree.

use std::io::Read;
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};

use super::FetchError;
use crate::package::Unpack;

/// Write `bytes` into `dest` according to `unpack`.
pub(crate) fn unpack_into(origin: &str, bytes: &[u8], unpack: Unpack, dest: &Path) -> Result<(), FetchError> {
  std::fs::create_dir_all(dest).map_err(|e| unpack_error(origin, e))?;

  match unpack {
    Unpack::File => {
      let target = dest.join(url_to_filename(origin));
      std::fs::write(&target, bytes).map_err(|e| unpack_error(origin, e))
    }
    Unpack::Tar => unpack_tar(origin, bytes, dest),
    Unpack::TarGz => unpack_tar(origin, GzDecoder::new(bytes), dest),
  }
}

fn unpack_tar<R: Read>(origin: &str, reader: R, dest: &Path) -> Result<(), FetchError> {
  let mut archive = tar::Archive::new(reader);
  let entries = archive.entries().map_err(|e| unpack_error(origin, e))?;

  for entry in entries {
    let mut entry = entry.map_err(|e| unpack_error(origin, e))?;
    let path = entry.path().map_err(|e| unpack_error(origin, e))?.into_owned();

    if !path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
      return Err(FetchError::Unpack {
        origin: origin.to_string(),
        message: format!("entry '{}' escapes the destination", path.display()),
      });
    }

    let unpacked = entry.unpack_in(dest).map_err(|e| unpack_error(origin, e))?;
    if !unpacked {
      return Err(FetchError::Unpack {
        origin: origin.to_string(),
        message: format!("entry '{}' was refused by the archive reader", path.display()),
      });
    }
  }

  Ok(())
}

fn unpack_error(origin: &str, err: std::io::Error) -> FetchError {
  FetchError::Unpack {
    origin: origin.to_string(),
    message: err.to_string(),
  }
}

/// Convert an origin to a safe file name.
///
/// Takes the last path component and sanitizes it. Falls back to a hash of
/// the origin if no suitable name can be extracted.
pub(crate) fn url_to_filename(origin: &str) -> String {
  if let Some(last) = origin.rsplit(['/', '\\']).next() {
    let last = last.split('?').next().unwrap_or(last);

    let sanitized: String = last
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
      return sanitized;
    }
  }

  let mut hasher = Sha256::new();
  hasher.update(origin.as_bytes());
  format!("source_{}", &hex::encode(hasher.finalize())[..16])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::{tar_gz_of, tar_of};
  use tempfile::TempDir;

  #[test]
  fn url_to_filename_strips_query() {
    assert_eq!(url_to_filename("https://example.com/file.tar.gz?token=abc"), "file.tar.gz");
  }

  #[test]
  fn url_to_filename_sanitizes() {
    assert_eq!(url_to_filename("https://example.com/file name.txt"), "file_name.txt");
    assert_eq!(url_to_filename("/local/dir/a.c"), "a.c");
  }

  #[test]
  fn url_to_filename_falls_back_to_hash() {
    assert!(url_to_filename("https://example.com/").starts_with("source_"));
  }

  #[test]
  fn single_file_is_written_under_origin_name() {
    let temp = TempDir::new().unwrap();
    unpack_into("file:///x/config.h", b"#define X 1\n", Unpack::File, temp.path()).unwrap();
    assert_eq!(std::fs::read(temp.path().join("config.h")).unwrap(), b"#define X 1\n");
  }

  #[test]
  fn tar_and_tar_gz_unpack() {
    let temp = TempDir::new().unwrap();
    unpack_into("a.tar", &tar_of(&[("src/main.c", "int main;")]), Unpack::Tar, temp.path()).unwrap();
    unpack_into("b.tar.gz", &tar_gz_of(&[("README", "hi")]), Unpack::TarGz, temp.path()).unwrap();

    assert_eq!(std::fs::read_to_string(temp.path().join("src/main.c")).unwrap(), "int main;");
    assert_eq!(std::fs::read_to_string(temp.path().join("README")).unwrap(), "hi");
  }

  #[test]
  fn garbage_tar_gz_is_unpack_error() {
    let temp = TempDir::new().unwrap();
    let err = unpack_into("bad.tar.gz", b"not gzip", Unpack::TarGz, temp.path()).unwrap_err();
    assert!(matches!(err, FetchError::Unpack { .. }));
  }
}
