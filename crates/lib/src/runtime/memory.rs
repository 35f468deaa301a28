//! In-memory runtime for tests and dry environments.
//!
//! Resources live in a map keyed by physical id. Every call is appended to a log with a
//! monotonically increasing sequence number, so callers can assert on ordering. Failures can
//! be injected per operation and logical id.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;

use crate::resource::{LogicalId, ResourceKind};
use crate::util::hash::ConfigHash;

use super::RuntimeClient;
use super::types::{PhysicalId, PhysicalState, ResourceSpec, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
  Ping,
  Ensure,
  Inspect,
  Update,
  Remove,
}

impl Operation {
  /// Whether the operation changes runtime state.
  pub fn is_mutating(&self) -> bool {
    matches!(self, Operation::Ensure | Operation::Update | Operation::Remove)
  }
}

/// One entry of the call log.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeCall {
  pub seq: u64,
  pub op: Operation,
  pub kind: Option<ResourceKind>,
  pub logical_id: Option<LogicalId>,
  pub physical_id: Option<PhysicalId>,
}

/// A resource held by the memory runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryResource {
  pub physical_id: PhysicalId,
  pub kind: ResourceKind,
  pub session: String,
  pub logical_id: LogicalId,
  pub name: String,
  pub config: BTreeMap<String, Value>,
  pub config_hash: ConfigHash,
  /// Physical ids this resource holds on to; they cannot be removed while it exists.
  pub uses: BTreeSet<PhysicalId>,
  pub status: Option<String>,
  /// Sequence number of the call that created it.
  pub created_seq: u64,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
  op: Operation,
  logical_id: LogicalId,
  error: RuntimeError,
  once: bool,
}

#[derive(Debug, Default)]
struct Inner {
  seq: u64,
  next_id: u64,
  resources: BTreeMap<PhysicalId, MemoryResource>,
  calls: Vec<RuntimeCall>,
  failures: Vec<InjectedFailure>,
  unavailable: bool,
}

impl Inner {
  fn log(
    &mut self,
    op: Operation,
    kind: Option<ResourceKind>,
    logical_id: Option<&LogicalId>,
    physical_id: Option<&str>,
  ) -> u64 {
    self.seq += 1;
    self.calls.push(RuntimeCall {
      seq: self.seq,
      op,
      kind,
      logical_id: logical_id.cloned(),
      physical_id: physical_id.map(str::to_string),
    });
    self.seq
  }

  fn check(&mut self, op: Operation, logical_id: Option<&LogicalId>) -> Result<(), RuntimeError> {
    if self.unavailable {
      return Err(RuntimeError::Unavailable("memory runtime is offline".to_string()));
    }
    let Some(logical_id) = logical_id else {
      return Ok(());
    };
    let Some(pos) = self
      .failures
      .iter()
      .position(|f| f.op == op && &f.logical_id == logical_id)
    else {
      return Ok(());
    };
    let failure = if self.failures[pos].once {
      self.failures.remove(pos)
    } else {
      self.failures[pos].clone()
    };
    Err(failure.error)
  }

  fn logical_id_of(&self, physical_id: &str) -> Option<LogicalId> {
    self.resources.get(physical_id).map(|r| r.logical_id.clone())
  }

  fn allocate_id(&mut self, kind: ResourceKind) -> PhysicalId {
    self.next_id += 1;
    format!("{}-{:04}", kind, self.next_id)
  }
}

/// A [`RuntimeClient`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryRuntime {
  inner: Mutex<Inner>,
  delay: Option<Duration>,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
}

impl MemoryRuntime {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every mutating call take `delay`, to exercise concurrency and cancellation.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Fail every `op` on `logical_id` with `error` until cleared.
  pub fn fail(&self, op: Operation, logical_id: impl Into<LogicalId>, error: RuntimeError) {
    self.lock().failures.push(InjectedFailure {
      op,
      logical_id: logical_id.into(),
      error,
      once: false,
    });
  }

  /// Fail the next `op` on `logical_id` with `error`.
  pub fn fail_once(&self, op: Operation, logical_id: impl Into<LogicalId>, error: RuntimeError) {
    self.lock().failures.push(InjectedFailure {
      op,
      logical_id: logical_id.into(),
      error,
      once: true,
    });
  }

  pub fn clear_failures(&self) {
    self.lock().failures.clear();
  }

  /// Simulate an unreachable runtime.
  pub fn set_unavailable(&self, unavailable: bool) {
    self.lock().unavailable = unavailable;
  }

  /// Delete a resource behind the reconciler's back. Returns whether it existed.
  pub fn delete_out_of_band(&self, physical_id: &str) -> bool {
    self.lock().resources.remove(physical_id).is_some()
  }

  /// The call log, in order.
  pub fn calls(&self) -> Vec<RuntimeCall> {
    self.lock().calls.clone()
  }

  /// Calls that changed runtime state.
  pub fn mutating_calls(&self) -> Vec<RuntimeCall> {
    self.lock().calls.iter().filter(|c| c.op.is_mutating()).cloned().collect()
  }

  /// Logical ids of every call with operation `op`, in order.
  pub fn calls_for(&self, op: Operation) -> Vec<LogicalId> {
    self
      .lock()
      .calls
      .iter()
      .filter(|c| c.op == op)
      .filter_map(|c| c.logical_id.clone())
      .collect()
  }

  pub fn clear_calls(&self) {
    self.lock().calls.clear();
  }

  pub fn resources(&self) -> Vec<MemoryResource> {
    self.lock().resources.values().cloned().collect()
  }

  pub fn resource(&self, physical_id: &str) -> Option<MemoryResource> {
    self.lock().resources.get(physical_id).cloned()
  }

  /// The live resource for a logical id, if any.
  pub fn find(&self, logical_id: impl Into<LogicalId>) -> Option<MemoryResource> {
    let logical_id = logical_id.into();
    self
      .lock()
      .resources
      .values()
      .find(|r| r.logical_id == logical_id)
      .cloned()
  }

  /// Highest number of mutating calls observed running at the same time.
  pub fn max_concurrency(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }

  async fn pause(&self) {
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    } else {
      tokio::task::yield_now().await;
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
  }

  fn ensure_now(&self, spec: &ResourceSpec) -> Result<PhysicalId, RuntimeError> {
    let mut inner = self.lock();
    let seq = inner.log(Operation::Ensure, Some(spec.kind), Some(&spec.logical_id), None);
    inner.check(Operation::Ensure, Some(&spec.logical_id))?;

    // Name conflicts: adopt our own leftover, reject anyone else's.
    let existing = inner
      .resources
      .values()
      .find(|r| r.kind == spec.kind && r.name == spec.name)
      .cloned();
    if let Some(existing) = existing {
      if existing.session != spec.session || existing.logical_id != spec.logical_id {
        return Err(RuntimeError::Rejected(format!(
          "{} name '{}' is already in use by {}",
          spec.kind, spec.name, existing.physical_id
        )));
      }
      if existing.config_hash == spec.config_hash {
        return Ok(existing.physical_id);
      }
      // Images are content addressed: the same reference resolves to the same image.
      if spec.kind == ResourceKind::Image
        && let Some(image) = inner.resources.get_mut(&existing.physical_id)
      {
        image.config = spec.config.clone();
        image.config_hash = spec.config_hash.clone();
        return Ok(existing.physical_id);
      }
      inner.resources.remove(&existing.physical_id);
    }

    let physical_id = inner.allocate_id(spec.kind);
    let status = match spec.kind {
      ResourceKind::Container => Some(container_status(spec).to_string()),
      _ => None,
    };
    let resource = MemoryResource {
      physical_id: physical_id.clone(),
      kind: spec.kind,
      session: spec.session.clone(),
      logical_id: spec.logical_id.clone(),
      name: spec.name.clone(),
      config: spec.config.clone(),
      config_hash: spec.config_hash.clone(),
      uses: spec.bindings.values().map(|b| b.physical_id.clone()).collect(),
      status,
      created_seq: seq,
    };
    inner.resources.insert(physical_id.clone(), resource);
    Ok(physical_id)
  }

  fn update_now(&self, spec: &ResourceSpec, physical_id: &str) -> Result<PhysicalId, RuntimeError> {
    let mut inner = self.lock();
    inner.log(Operation::Update, Some(spec.kind), Some(&spec.logical_id), Some(physical_id));
    inner.check(Operation::Update, Some(&spec.logical_id))?;

    let Some(resource) = inner.resources.get_mut(physical_id) else {
      return Err(RuntimeError::Rejected(format!("no such {}: {}", spec.kind, physical_id)));
    };
    resource.config = spec.config.clone();
    resource.config_hash = spec.config_hash.clone();
    if spec.kind == ResourceKind::Container {
      resource.status = Some(container_status(spec).to_string());
    }
    Ok(physical_id.to_string())
  }

  fn remove_now(&self, kind: ResourceKind, physical_id: &str) -> Result<(), RuntimeError> {
    let mut inner = self.lock();
    let logical_id = inner.logical_id_of(physical_id);
    inner.log(Operation::Remove, Some(kind), logical_id.as_ref(), Some(physical_id));
    inner.check(Operation::Remove, logical_id.as_ref())?;

    if !inner.resources.contains_key(physical_id) {
      return Ok(());
    }
    if let Some(user) = inner.resources.values().find(|r| r.uses.contains(physical_id)) {
      return Err(RuntimeError::Rejected(format!(
        "{} {} is in use by {} {}",
        kind, physical_id, user.kind, user.physical_id
      )));
    }
    inner.resources.remove(physical_id);
    Ok(())
  }
}

fn container_status(spec: &ResourceSpec) -> &'static str {
  match spec.get_str("status") {
    Some("created") => "created",
    Some("stopped") => "exited",
    _ => "running",
  }
}

impl RuntimeClient for MemoryRuntime {
  async fn ping(&self) -> Result<(), RuntimeError> {
    let mut inner = self.lock();
    inner.log(Operation::Ping, None, None, None);
    inner.check(Operation::Ping, None)
  }

  async fn ensure(&self, spec: &ResourceSpec) -> Result<PhysicalId, RuntimeError> {
    self.pause().await;
    self.ensure_now(spec)
  }

  async fn inspect(&self, kind: ResourceKind, physical_id: &str) -> Result<Option<PhysicalState>, RuntimeError> {
    let mut inner = self.lock();
    let logical_id = inner.logical_id_of(physical_id);
    inner.log(Operation::Inspect, Some(kind), logical_id.as_ref(), Some(physical_id));
    inner.check(Operation::Inspect, logical_id.as_ref())?;

    Ok(
      inner
        .resources
        .get(physical_id)
        .filter(|r| r.kind == kind)
        .map(|r| PhysicalState {
          physical_id: r.physical_id.clone(),
          name: r.name.clone(),
          status: r.status.clone(),
          labels: BTreeMap::new(),
        }),
    )
  }

  async fn update(&self, spec: &ResourceSpec, physical_id: &str) -> Result<PhysicalId, RuntimeError> {
    self.pause().await;
    self.update_now(spec, physical_id)
  }

  async fn remove(&self, kind: ResourceKind, physical_id: &str) -> Result<(), RuntimeError> {
    self.pause().await;
    self.remove_now(kind, physical_id)
  }
}
