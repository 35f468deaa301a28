//! Types for reconciliation runs.
//!
//! This module defines the options, error type, per-resource outcomes and the report
//! returned by a run, plus the plan produced by a dry run.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::DEFAULT_PARALLELISM;
use crate::resource::{ConfigurationError, LogicalId, ResourceKind};
use crate::runtime::{PhysicalId, RuntimeError};
use crate::state::StateError;
use crate::util::hash::HashError;

/// Errors that stop a run before or while it touches the runtime.
///
/// Per-resource runtime failures do not surface here; they are listed in the report.
#[derive(Debug, Error)]
pub enum ReconcileError {
  /// The declarations are invalid. Raised before any runtime call.
  #[error(transparent)]
  Configuration(#[from] ConfigurationError),

  /// Reading or writing the state store failed.
  #[error("state store error: {0}")]
  State(#[from] StateError),

  /// A runtime call on behalf of a resource failed.
  #[error("{kind} '{id}': {source}")]
  Runtime {
    kind: ResourceKind,
    id: LogicalId,
    #[source]
    source: RuntimeError,
  },

  /// The canonical configuration could not be hashed.
  #[error("failed to hash configuration of '{id}': {source}")]
  Hash {
    id: LogicalId,
    #[source]
    source: HashError,
  },

  /// The state handle was opened read-only.
  #[error("state store is opened read-only")]
  ReadOnly,

  /// A worker task panicked or was aborted.
  #[error("reconcile task failed: {0}")]
  Task(String),
}

impl ReconcileError {
  /// Whether re-running may succeed without changing the declarations.
  pub fn is_transient(&self) -> bool {
    match self {
      ReconcileError::Runtime { source, .. } => source.is_transient(),
      _ => false,
    }
  }
}

/// Configuration for a reconciliation run.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
  /// Maximum number of resources reconciled at the same time.
  pub parallelism: usize,

  /// Cancel the run once this much time has passed. In-flight operations still complete.
  pub timeout: Option<Duration>,
}

impl Default for ReconcileOptions {
  fn default() -> Self {
    Self {
      parallelism: DEFAULT_PARALLELISM,
      timeout: None,
    }
  }
}

/// Final state of a resource that was processed successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
  Created,
  Updated,
  Recreated,
  Deleted,
  Unchanged,
}

impl fmt::Display for Outcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Outcome::Created => "created",
      Outcome::Updated => "updated",
      Outcome::Recreated => "recreated",
      Outcome::Deleted => "deleted",
      Outcome::Unchanged => "unchanged",
    };
    f.write_str(s)
  }
}

/// Why a resource was never started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "dependency")]
pub enum SkipReason {
  /// A dependency failed or was itself skipped.
  DependencyFailed(LogicalId),
  /// Another resource failed and the run stopped.
  Aborted,
  /// The run was cancelled or timed out.
  Cancelled,
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SkipReason::DependencyFailed(dep) => write!(f, "dependency '{}' failed", dep),
      SkipReason::Aborted => f.write_str("run aborted"),
      SkipReason::Cancelled => f.write_str("run cancelled"),
    }
  }
}

/// A resource that reached a final state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
  pub logical_id: LogicalId,
  pub kind: ResourceKind,
  /// Runtime name of the resource.
  pub name: String,
  /// Physical id after the run; for deletions, the id that was removed.
  pub physical_id: PhysicalId,
  /// Position in commit order, starting at 1.
  pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
  pub logical_id: LogicalId,
  pub kind: ResourceKind,
  pub error: String,
  /// Whether the failure was a transient runtime outage.
  pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
  pub logical_id: LogicalId,
  pub kind: ResourceKind,
  #[serde(flatten)]
  pub reason: SkipReason,
}

/// Per-resource result of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
  pub session: String,
  pub created: Vec<ReportEntry>,
  pub updated: Vec<ReportEntry>,
  pub recreated: Vec<ReportEntry>,
  pub deleted: Vec<ReportEntry>,
  pub unchanged: Vec<ReportEntry>,
  pub failed: Vec<FailedEntry>,
  pub skipped: Vec<SkippedEntry>,
  /// Resources found missing from the runtime and created again.
  pub drifted: Vec<LogicalId>,
  /// Whether the run stopped early because of cancellation or timeout.
  pub cancelled: bool,
}

impl ReconciliationReport {
  pub fn new(session: &str) -> Self {
    Self {
      session: session.to_string(),
      ..Default::default()
    }
  }

  pub(crate) fn record(&mut self, outcome: Outcome, entry: ReportEntry) {
    let list = match outcome {
      Outcome::Created => &mut self.created,
      Outcome::Updated => &mut self.updated,
      Outcome::Recreated => &mut self.recreated,
      Outcome::Deleted => &mut self.deleted,
      Outcome::Unchanged => &mut self.unchanged,
    };
    list.push(entry);
  }

  pub(crate) fn fail(&mut self, kind: ResourceKind, logical_id: LogicalId, error: &ReconcileError) {
    self.failed.push(FailedEntry {
      logical_id,
      kind,
      error: error.to_string(),
      transient: error.is_transient(),
    });
  }

  pub(crate) fn skip(&mut self, kind: ResourceKind, logical_id: LogicalId, reason: SkipReason) {
    self.skipped.push(SkippedEntry {
      logical_id,
      kind,
      reason,
    });
  }

  /// Sort every list by commit order (failures and skips by logical id).
  pub(crate) fn sort(&mut self) {
    for list in [
      &mut self.created,
      &mut self.updated,
      &mut self.recreated,
      &mut self.deleted,
      &mut self.unchanged,
    ] {
      list.sort_by_key(|entry| entry.seq);
    }
    self.failed.sort_by(|a, b| a.logical_id.cmp(&b.logical_id));
    self.skipped.sort_by(|a, b| a.logical_id.cmp(&b.logical_id));
    self.drifted.sort();
  }

  /// Returns true when nothing failed or was skipped.
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }

  /// Number of resources the run changed.
  pub fn changed(&self) -> usize {
    self.created.len() + self.updated.len() + self.recreated.len() + self.deleted.len()
  }

  /// Total number of resources accounted for.
  pub fn total(&self) -> usize {
    self.changed() + self.unchanged.len() + self.failed.len() + self.skipped.len()
  }

  /// Find the outcome and entry for a logical id.
  ///
  /// A resource that was displaced and then created again appears once as recreated.
  pub fn outcome(&self, id: &LogicalId) -> Option<(Outcome, &ReportEntry)> {
    [
      (Outcome::Created, &self.created),
      (Outcome::Updated, &self.updated),
      (Outcome::Recreated, &self.recreated),
      (Outcome::Unchanged, &self.unchanged),
      (Outcome::Deleted, &self.deleted),
    ]
    .into_iter()
    .find_map(|(outcome, list)| list.iter().find(|e| &e.logical_id == id).map(|e| (outcome, e)))
  }

  /// Every successful entry in commit order.
  pub fn entries(&self) -> Vec<(Outcome, &ReportEntry)> {
    let mut entries: Vec<(Outcome, &ReportEntry)> = [
      (Outcome::Created, &self.created),
      (Outcome::Updated, &self.updated),
      (Outcome::Recreated, &self.recreated),
      (Outcome::Deleted, &self.deleted),
      (Outcome::Unchanged, &self.unchanged),
    ]
    .into_iter()
    .flat_map(|(outcome, list)| list.iter().map(move |e| (outcome, e)))
    .collect();
    entries.sort_by_key(|(_, e)| e.seq);
    entries
  }
}

/// What a run would do to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
  Create,
  Update,
  Recreate,
  Delete,
  Unchanged,
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Action::Create => "create",
      Action::Update => "update",
      Action::Recreate => "recreate",
      Action::Delete => "delete",
      Action::Unchanged => "unchanged",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChange {
  pub logical_id: LogicalId,
  pub kind: ResourceKind,
  pub action: Action,
  /// Current physical id, when one is recorded.
  pub physical_id: Option<PhysicalId>,
  /// Human-readable cause, e.g. the options that changed.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
}

/// The changes a run would make, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
  pub session: String,
  pub changes: Vec<PlannedChange>,
}

impl Plan {
  /// Whether applying the plan would change anything.
  pub fn has_changes(&self) -> bool {
    self.changes.iter().any(|c| c.action != Action::Unchanged)
  }

  pub fn count(&self, action: Action) -> usize {
    self.changes.iter().filter(|c| c.action == action).count()
  }

  pub fn get(&self, id: &LogicalId) -> Option<&PlannedChange> {
    self.changes.iter().find(|c| &c.logical_id == id)
  }
}
