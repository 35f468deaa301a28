//! Per-session advisory locks.
//!
//! Each session directory holds a `.lock` file. A reconciling process keeps an exclusive
//! lock on it for the whole run and writes a [`LockHolder`] record into it; planning and
//! status take shared locks. Acquisition never waits.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Who holds an exclusive session lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  pub command: String,
  /// Seconds since the Unix epoch.
  pub since: u64,
}

impl LockHolder {
  fn current(command: &str) -> Self {
    Self {
      pid: std::process::id(),
      command: command.to_string(),
      since: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    }
  }

  fn since_rfc3339(&self) -> String {
    humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(self.since)).to_string()
  }
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error("session is in use by '{}' (pid {}, since {}); remove {} if that process is gone", .holder.command, .holder.pid, .holder.since_rfc3339(), .path.display())]
  Held { holder: LockHolder, path: PathBuf },

  #[error("session is in use by another process; remove {} if no dockyard process is running", .path.display())]
  HeldUnknown { path: PathBuf },

  #[error("cannot {action} {}: {source}", .path.display())]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl StoreLockError {
  /// Whether another process holds the lock, as opposed to an I/O failure.
  pub fn is_contention(&self) -> bool {
    matches!(self, StoreLockError::Held { .. } | StoreLockError::HeldUnknown { .. })
  }

  fn io(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
    let path = path.to_path_buf();
    move |source| StoreLockError::Io { action, path, source }
  }
}

/// A held session lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  path: PathBuf,
}

impl StoreLock {
  /// Lock the session directory `dir`, creating it first if needed.
  pub fn acquire(dir: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    std::fs::create_dir_all(dir).map_err(StoreLockError::io("create", dir))?;

    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(StoreLockError::io("open", &path))?;

    match try_lock(&file, mode) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        return Err(match read_holder(&mut &file) {
          Some(holder) => StoreLockError::Held { holder, path },
          None => StoreLockError::HeldUnknown { path },
        });
      }
      Err(e) => return Err(StoreLockError::io("lock", &path)(e)),
    }

    let lock = StoreLock { file, path };
    if mode == LockMode::Exclusive {
      lock.write_holder(&LockHolder::current(command))?;
    }
    Ok(lock)
  }

  fn write_holder(&self, holder: &LockHolder) -> Result<(), StoreLockError> {
    let json = serde_json::to_vec(holder).map_err(|e| StoreLockError::io("write", &self.path)(io::Error::other(e)))?;
    let mut file = &self.file;
    file.set_len(0).map_err(StoreLockError::io("write", &self.path))?;
    file.seek(SeekFrom::Start(0)).map_err(StoreLockError::io("write", &self.path))?;
    file.write_all(&json).map_err(StoreLockError::io("write", &self.path))?;
    file.flush().map_err(StoreLockError::io("write", &self.path))
  }

  /// The holder record, read through the held handle.
  pub fn holder(&self) -> Option<LockHolder> {
    read_holder(&mut &self.file)
  }

  pub fn lock_path(&self) -> &Path {
    &self.path
  }
}

fn read_holder(file: &mut &File) -> Option<LockHolder> {
  file.seek(SeekFrom::Start(0)).ok()?;
  let mut contents = String::new();
  file.read_to_string(&mut contents).ok()?;
  serde_json::from_str(&contents).ok()
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };
  flock(file, operation).map_err(io::Error::from)
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
  if mode == LockMode::Exclusive {
    flags |= LOCKFILE_EXCLUSIVE_LOCK;
  }

  // SAFETY: the handle is owned by `file` and stays open for the call; a zeroed
  // OVERLAPPED is a valid argument.
  let locked = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(file.as_raw_handle() as HANDLE, flags, 0, 1, 0, &mut overlapped)
  };
  if locked == 0 {
    // ERROR_LOCK_VIOLATION maps to an uncategorized kind; report it as contention.
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(33) {
      return Err(io::Error::from(io::ErrorKind::WouldBlock));
    }
    return Err(err);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn exclusive_lock_records_its_holder() {
    let temp = TempDir::new().unwrap();
    let lock = StoreLock::acquire(temp.path(), LockMode::Exclusive, "dockyard apply").unwrap();

    let holder = lock.holder().unwrap();
    assert_eq!(holder.command, "dockyard apply");
    assert_eq!(holder.pid, std::process::id());
    assert_eq!(lock.lock_path(), temp.path().join(LOCK_FILE));
  }

  #[test]
  fn missing_session_directory_is_created() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("sessions").join("web");
    StoreLock::acquire(&dir, LockMode::Shared, "status").unwrap();
    assert!(dir.join(LOCK_FILE).exists());
  }

  #[test]
  fn shared_locks_coexist() {
    let temp = TempDir::new().unwrap();
    let _plan = StoreLock::acquire(temp.path(), LockMode::Shared, "plan").unwrap();
    assert!(StoreLock::acquire(temp.path(), LockMode::Shared, "status").is_ok());
  }

  #[test]
  fn exclusive_holder_blocks_everyone_else() {
    let temp = TempDir::new().unwrap();
    let _held = StoreLock::acquire(temp.path(), LockMode::Exclusive, "dockyard apply").unwrap();

    let err = StoreLock::acquire(temp.path(), LockMode::Exclusive, "dockyard destroy").unwrap_err();
    assert!(err.is_contention());
    assert!(err.to_string().contains("in use by 'dockyard apply'"), "{err}");

    let err = StoreLock::acquire(temp.path(), LockMode::Shared, "status").unwrap_err();
    assert!(err.is_contention());
  }

  #[test]
  fn shared_holder_blocks_exclusive() {
    let temp = TempDir::new().unwrap();
    let _plan = StoreLock::acquire(temp.path(), LockMode::Shared, "plan").unwrap();
    let err = StoreLock::acquire(temp.path(), LockMode::Exclusive, "apply").unwrap_err();
    assert!(matches!(err, StoreLockError::HeldUnknown { .. } | StoreLockError::Held { .. }));
  }

  #[test]
  fn dropping_the_lock_releases_it() {
    let temp = TempDir::new().unwrap();
    drop(StoreLock::acquire(temp.path(), LockMode::Exclusive, "first").unwrap());
    let lock = StoreLock::acquire(temp.path(), LockMode::Exclusive, "second").unwrap();
    assert_eq!(lock.holder().unwrap().command, "second");
  }

  #[test]
  fn holder_start_time_is_rfc3339() {
    let holder = LockHolder {
      pid: 1,
      command: "apply".to_string(),
      since: 0,
    };
    assert_eq!(holder.since_rfc3339(), "1970-01-01T00:00:00Z");
  }
}
