//! Reading and writing session state on disk.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace};

use crate::consts::STATE_VERSION;
use crate::resource::LogicalId;
use crate::store_lock::{LockMode, StoreLock};

use super::types::{RecordChanges, StateError, StateFile, StateRecord};

/// State file name within a session directory.
const STATE_FILENAME: &str = "state.json";

/// A session's state records, backed by `state.json` and guarded by the session lock.
///
/// The in-memory view only changes after the new file has been renamed into place, so a
/// failed write leaves both the file and the view at the previous commit.
#[derive(Debug)]
pub struct StateStore {
  dir: PathBuf,
  session: String,
  records: BTreeMap<LogicalId, StateRecord>,
  mode: LockMode,
  lock: StoreLock,
}

impl StateStore {
  /// Lock the session directory under `state_root` and load its records.
  ///
  /// An exclusive lock is required to commit. Contention fails immediately with
  /// [`StateError::Lock`].
  pub fn open(state_root: &Path, session: &str, mode: LockMode, command: &str) -> Result<Self, StateError> {
    if !is_valid_session_name(session) {
      return Err(StateError::InvalidSessionName(session.to_string()));
    }

    let dir = state_root.join(session);
    let lock = StoreLock::acquire(&dir, mode, command)?;
    let records = read_records(&dir, session)?;

    debug!(session, records = records.len(), path = %dir.display(), "opened state store");

    Ok(Self {
      dir,
      session: session.to_string(),
      records,
      mode,
      lock,
    })
  }

  pub fn session(&self) -> &str {
    &self.session
  }

  /// Whether this handle holds the exclusive lock needed to commit.
  pub fn is_writable(&self) -> bool {
    self.mode == LockMode::Exclusive
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn state_path(&self) -> PathBuf {
    self.dir.join(STATE_FILENAME)
  }

  pub fn lock_path(&self) -> &Path {
    self.lock.lock_path()
  }

  /// Re-read every record from disk. A session that was never committed yields an empty map.
  pub fn load(&self) -> Result<BTreeMap<LogicalId, StateRecord>, StateError> {
    read_records(&self.dir, &self.session)
  }

  /// The records as of the last successful commit.
  pub fn records(&self) -> &BTreeMap<LogicalId, StateRecord> {
    &self.records
  }

  pub fn get(&self, id: &LogicalId) -> Option<&StateRecord> {
    self.records.get(id)
  }

  /// Atomically apply a batch of upserts and tombstones.
  pub fn commit(&mut self, changes: RecordChanges) -> Result<(), StateError> {
    if self.mode != LockMode::Exclusive {
      return Err(StateError::ReadOnly);
    }

    let mut next = self.records.clone();
    for (id, change) in changes {
      match change {
        Some(record) => {
          trace!(resource = %id, physical_id = %record.physical_id, "commit record");
          next.insert(id, record);
        }
        None => {
          trace!(resource = %id, "commit tombstone");
          next.remove(&id);
        }
      }
    }

    let file = StateFile {
      version: STATE_VERSION,
      session: self.session.clone(),
      updated_at: now_millis(),
      records: next,
    };
    self.write(&file)?;
    self.records = file.records;
    Ok(())
  }

  /// Insert or replace one record.
  pub fn put(&mut self, record: StateRecord) -> Result<(), StateError> {
    self.commit(BTreeMap::from([(record.logical_id.clone(), Some(record))]))
  }

  /// Remove one record.
  pub fn tombstone(&mut self, id: &LogicalId) -> Result<(), StateError> {
    self.commit(BTreeMap::from([(id.clone(), None)]))
  }

  /// Write the state file atomically (write to temp, then rename).
  fn write(&self, file: &StateFile) -> Result<(), StateError> {
    fs::create_dir_all(&self.dir).map_err(StateError::CreateDir)?;

    let path = self.state_path();
    let temp_path = self.dir.join(format!("{}.tmp", STATE_FILENAME));

    let content = serde_json::to_string_pretty(file).map_err(StateError::Serialize)?;
    fs::write(&temp_path, &content).map_err(StateError::Write)?;
    fs::rename(&temp_path, &path).map_err(StateError::Write)?;

    Ok(())
  }
}

fn read_records(dir: &Path, session: &str) -> Result<BTreeMap<LogicalId, StateRecord>, StateError> {
  let path = dir.join(STATE_FILENAME);

  let content = match fs::read_to_string(&path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
    Err(e) => return Err(StateError::Read(e)),
  };

  let file: StateFile = serde_json::from_str(&content).map_err(StateError::Parse)?;

  if file.version != STATE_VERSION {
    return Err(StateError::UnsupportedVersion(file.version));
  }
  if file.session != session {
    return Err(StateError::SessionMismatch {
      expected: session.to_string(),
      found: file.session,
    });
  }

  Ok(file.records)
}

/// Session names become directory names, so they follow the same rules as logical ids.
pub fn is_valid_session_name(name: &str) -> bool {
  LogicalId::from(name).is_valid()
}

/// List sessions under `state_root` that have committed state, sorted by name.
pub fn list_sessions(state_root: &Path) -> Result<Vec<String>, StateError> {
  let entries = match fs::read_dir(state_root) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(StateError::Read(e)),
  };

  let mut sessions = Vec::new();
  for entry in entries {
    let entry = entry.map_err(StateError::Read)?;
    let path = entry.path();
    if path.join(STATE_FILENAME).is_file()
      && let Some(name) = path.file_name().and_then(|n| n.to_str())
    {
      sessions.push(name.to_string());
    }
  }
  sessions.sort();
  Ok(sessions)
}

pub(crate) fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or_default()
}
