use std::collections::{BTreeMap, BTreeSet};
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::STATE_VERSION;
use crate::resource::{LogicalId, ResourceKind};
use crate::runtime::PhysicalId;
use crate::store_lock::StoreLockError;
use crate::util::hash::ConfigHash;

/// What the store remembers about one physical resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
  pub logical_id: LogicalId,
  pub kind: ResourceKind,
  pub physical_id: PhysicalId,
  /// Name the runtime knows the resource by.
  pub name: String,
  pub config_hash: ConfigHash,
  /// Canonical configuration as last applied.
  #[serde(default)]
  pub config: BTreeMap<String, serde_json::Value>,
  #[serde(default)]
  pub depends_on: BTreeSet<LogicalId>,
  /// Physical ids of every `Ref` dependency when the resource was applied.
  #[serde(default)]
  pub bindings: BTreeMap<LogicalId, PhysicalId>,
  /// Unix milliseconds.
  pub applied_at: u64,
}

/// A batch of record changes; `None` tombstones the record.
pub type RecordChanges = BTreeMap<LogicalId, Option<StateRecord>>;

/// On-disk layout of `state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
  pub version: u32,
  pub session: String,
  pub updated_at: u64,
  pub records: BTreeMap<LogicalId, StateRecord>,
}

impl StateFile {
  pub fn new(session: &str) -> Self {
    Self {
      version: STATE_VERSION,
      session: session.to_string(),
      updated_at: 0,
      records: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Error)]
pub enum StateError {
  #[error("invalid session name '{0}': use letters, digits, '_', '.' or '-'")]
  InvalidSessionName(String),

  #[error("failed to create state directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to read state: {0}")]
  Read(#[source] io::Error),

  #[error("failed to write state: {0}")]
  Write(#[source] io::Error),

  #[error("failed to parse state file: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize state: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported state version {0} (expected {STATE_VERSION})")]
  UnsupportedVersion(u32),

  #[error("state file belongs to session '{found}', expected '{expected}'")]
  SessionMismatch { expected: String, found: String },

  #[error("state was opened read-only")]
  ReadOnly,

  #[error(transparent)]
  Lock(#[from] StoreLockError),
}

impl StateError {
  /// Whether another process holds the session's store.
  pub fn is_locked(&self) -> bool {
    matches!(self, StateError::Lock(e) if e.is_contention())
  }
}
