//! Advisory locking of a store directory between processes.
//!
//! `ovl build` takes the lock exclusively and records itself as the holder.
//! `ovl plan` and `ovl graph` never open a store and take no lock. Shared
//! locks coexist with each other but not with an exclusive one. Within a
//! process, concurrent builds coordinate through the executor instead.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Who holds an exclusive lock.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockHolder {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub store: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error(
    "store is in use by `{command}` (PID {pid}, started at unix time {started_at_unix})\n\
     if no overlay process is running, remove {lock_path}"
  )]
  Held {
    command: String,
    pid: u32,
    started_at_unix: u64,
    lock_path: PathBuf,
  },

  #[error("store is in use by another process\nif no overlay process is running, remove {lock_path}")]
  HeldUnknown { lock_path: PathBuf },

  #[error("failed to prepare lock file {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to record lock holder: {0}")]
  Record(#[source] io::Error),

  #[error("failed to lock store: {0}")]
  Lock(#[source] io::Error),
}

/// Held for as long as the value lives.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  lock_path: PathBuf,
}

impl StoreLock {
  /// Lock the store rooted at `store` without blocking.
  ///
  /// # Errors
  ///
  /// [`StoreLockError::Held`] (or `HeldUnknown` when the holder record is
  /// unreadable) if another process holds a conflicting lock.
  pub fn acquire(store: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    let lock_path = store.join(LOCK_FILENAME);
    let open_error = |source| StoreLockError::Open {
      path: lock_path.clone(),
      source,
    };

    std::fs::create_dir_all(store).map_err(open_error)?;
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(open_error)?;

    if let Err(err) = try_lock(&file, mode) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(held_error(&lock_path));
      }
      return Err(StoreLockError::Lock(err));
    }

    if mode == LockMode::Exclusive {
      write_holder(&file, command, store)?;
    }

    debug!(path = ?lock_path, mode = ?mode, "store locked");
    Ok(StoreLock { file, lock_path })
  }

  /// Read the holder record through the held handle.
  pub fn holder(&self) -> io::Result<LockHolder> {
    use std::io::{Seek, SeekFrom};

    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

fn write_holder(file: &File, command: &str, store: &Path) -> Result<(), StoreLockError> {
  let holder = LockHolder {
    version: 1,
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    command: command.to_string(),
    store: store.to_path_buf(),
  };

  file.set_len(0).map_err(StoreLockError::Record)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &holder).map_err(|e| StoreLockError::Record(io::Error::other(e)))?;
  writer.flush().map_err(StoreLockError::Record)
}

fn held_error(lock_path: &Path) -> StoreLockError {
  let holder = std::fs::read_to_string(lock_path)
    .ok()
    .and_then(|contents| serde_json::from_str::<LockHolder>(&contents).ok());

  match holder {
    Some(holder) => StoreLockError::Held {
      command: holder.command,
      pid: holder.pid,
      started_at_unix: holder.started_at_unix,
      lock_path: lock_path.to_path_buf(),
    },
    None => StoreLockError::HeldUnknown {
      lock_path: lock_path.to_path_buf(),
    },
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let flags = match mode {
    LockMode::Shared => LOCKFILE_FAIL_IMMEDIATELY,
    LockMode::Exclusive => LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
  };

  // SAFETY: a zeroed OVERLAPPED is valid and the handle is owned by `file`.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn exclusive_lock_records_holder() {
    let temp = TempDir::new().unwrap();
    let lock = StoreLock::acquire(temp.path(), LockMode::Exclusive, "ovl build").unwrap();

    assert!(lock.lock_path().exists());
    let holder = lock.holder().unwrap();
    assert_eq!(holder.version, 1);
    assert_eq!(holder.command, "ovl build");
    assert_eq!(holder.pid, std::process::id());
  }

  #[test]
  fn shared_locks_coexist() {
    let temp = TempDir::new().unwrap();
    let a = StoreLock::acquire(temp.path(), LockMode::Shared, "a").unwrap();
    let b = StoreLock::acquire(temp.path(), LockMode::Shared, "b").unwrap();
    assert_eq!(a.lock_path(), b.lock_path());
  }

  #[test]
  fn exclusive_lock_excludes_everyone_else() {
    let temp = TempDir::new().unwrap();
    let _held = StoreLock::acquire(temp.path(), LockMode::Exclusive, "ovl build").unwrap();

    for mode in [LockMode::Exclusive, LockMode::Shared] {
      match StoreLock::acquire(temp.path(), mode, "second") {
        Err(StoreLockError::Held { command, pid, .. }) => {
          assert_eq!(command, "ovl build");
          assert_eq!(pid, std::process::id());
        }
        other => panic!("unexpected result for {mode:?}: {other:?}"),
      }
    }
  }

  #[test]
  fn shared_lock_blocks_exclusive() {
    let temp = TempDir::new().unwrap();
    let _reader = StoreLock::acquire(temp.path(), LockMode::Shared, "reader").unwrap();
    let err = StoreLock::acquire(temp.path(), LockMode::Exclusive, "ovl build").unwrap_err();
    assert!(matches!(err, StoreLockError::HeldUnknown { .. }), "{err}");
  }

  #[test]
  fn lock_is_released_on_drop() {
    let temp = TempDir::new().unwrap();
    {
      let _lock = StoreLock::acquire(temp.path(), LockMode::Exclusive, "first").unwrap();
    }
    assert!(StoreLock::acquire(temp.path(), LockMode::Exclusive, "second").is_ok());
  }

  #[test]
  fn missing_store_directory_is_created() {
    let temp = TempDir::new().unwrap();
    let store = temp.path().join("nested/store");
    StoreLock::acquire(&store, LockMode::Shared, "x").unwrap();
    assert!(store.is_dir());
  }
}
