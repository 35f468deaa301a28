//! Shared helpers for reconciliation scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;

use tempfile::TempDir;

use dockyard_lib::execute::{ReconcileOptions, ReconciliationReport, ReportEntry};
use dockyard_lib::resource::{Config, ConfigValue, LogicalId};
use dockyard_lib::runtime::{MemoryRuntime, Operation};
use dockyard_lib::session::{Session, SessionOptions};
use dockyard_lib::state::StateRecord;

pub const SESSION: &str = "test";

/// An isolated state root plus an in-memory runtime.
pub struct Harness {
  pub temp: TempDir,
  pub runtime: Arc<MemoryRuntime>,
}

impl Harness {
  pub fn new() -> Self {
    Self::with_runtime(MemoryRuntime::new())
  }

  pub fn with_runtime(runtime: MemoryRuntime) -> Self {
    Self {
      temp: TempDir::new().unwrap(),
      runtime: Arc::new(runtime),
    }
  }

  pub fn options(&self) -> SessionOptions {
    SessionOptions::new(SESSION).with_state_root(self.temp.path())
  }

  pub fn session(&self) -> Session<MemoryRuntime> {
    self.session_with(ReconcileOptions::default())
  }

  pub fn session_with(&self, reconcile: ReconcileOptions) -> Session<MemoryRuntime> {
    Session::open(self.runtime.clone(), self.options().with_reconcile(reconcile)).unwrap()
  }

  /// Declare with `declare`, finalize, and return the report.
  pub async fn apply(&self, declare: impl FnOnce(&mut Session<MemoryRuntime>)) -> ReconciliationReport {
    let mut session = self.session();
    declare(&mut session);
    session.finalize().await.unwrap()
  }

  /// Records as persisted on disk.
  pub async fn records(&self) -> BTreeMap<LogicalId, StateRecord> {
    Session::open_read_only(self.runtime.clone(), self.options())
      .unwrap()
      .records()
      .await
  }

  /// Logical ids of every call with operation `op`, as strings.
  pub fn calls(&self, op: Operation) -> Vec<String> {
    self
      .runtime
      .calls_for(op)
      .into_iter()
      .map(|id| id.as_str().to_string())
      .collect()
  }
}

pub fn ids(entries: &[ReportEntry]) -> Vec<&str> {
  entries.iter().map(|e| e.logical_id.as_str()).collect()
}

pub fn physical_id(report: &ReconciliationReport, id: &str) -> String {
  report
    .outcome(&LogicalId::from(id))
    .map(|(_, entry)| entry.physical_id.clone())
    .unwrap_or_else(|| panic!("no outcome for {}", id))
}

/// Network `n1` and container `c1` attached to it, with `MODE` set to `mode`.
pub fn web_stack(session: &mut Session<MemoryRuntime>, mode: &str) {
  let n1 = session.network("n1", Config::new()).unwrap();
  session
    .container(
      "c1",
      Config::new()
        .with("image", "nginx:alpine")
        .with("networking", ConfigValue::list([n1.reference()]))
        .with("environment", ConfigValue::map([("MODE", mode)])),
    )
    .unwrap();
}
