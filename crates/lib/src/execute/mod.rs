//! Reconciliation of declared resources against recorded state and the runtime.
//!
//! This module provides the [`Reconciler`], which drives one run:
//! - Validates declarations and builds the dependency DAG (no runtime calls on error)
//! - Renders and hashes every descriptor's configuration
//! - Converges resources wave by wave, with bounded parallelism inside a wave
//! - Commits a state record after every successful runtime call
//! - Deletes recorded resources that are no longer declared, dependents first
//!
//! A failure stops the run after the current wave; resources already converged stay in
//! place and are recorded, so the next run only retries outstanding work.

pub mod dag;
mod destroy;
mod plan;
mod resolve;
mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::resource::{Declarations, LogicalId, ResourceKind};
use crate::runtime::{Binding, PhysicalId, ResourceSpec, RuntimeClient, RuntimeError, UpdatePolicy};
use crate::state::{StateRecord, StateStore, now_millis};

use resolve::Desired;

pub use dag::ResourceDag;
pub use types::{
  Action, FailedEntry, Outcome, Plan, PlannedChange, ReconcileError, ReconcileOptions, ReconciliationReport,
  ReportEntry, SkipReason, SkippedEntry,
};

/// Drives reconciliation runs for one session.
///
/// The reconciler owns the session's state store for its lifetime. All record commits go
/// through a single async mutex, so concurrent resource operations never interleave writes.
pub struct Reconciler<R: RuntimeClient> {
  runtime: Arc<R>,
  store: Arc<Mutex<StateStore>>,
  session: String,
  options: ReconcileOptions,
  cancel: CancellationToken,
}

impl<R: RuntimeClient> Reconciler<R> {
  pub fn new(runtime: Arc<R>, store: StateStore) -> Self {
    Self {
      runtime,
      session: store.session().to_string(),
      store: Arc::new(Mutex::new(store)),
      options: ReconcileOptions::default(),
      cancel: CancellationToken::new(),
    }
  }

  pub fn with_options(mut self, options: ReconcileOptions) -> Self {
    self.options = options;
    self
  }

  /// Use `cancel` to stop runs from outside.
  pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  /// Token that cancels the current run once triggered.
  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  pub fn session(&self) -> &str {
    &self.session
  }

  pub fn runtime(&self) -> &Arc<R> {
    &self.runtime
  }

  /// Snapshot of the records currently held by the store.
  pub async fn records(&self) -> BTreeMap<LogicalId, StateRecord> {
    self.store.lock().await.records().clone()
  }

  /// Release the state store (and its lock).
  pub fn into_store(self) -> Option<StateStore> {
    Arc::try_unwrap(self.store).ok().map(Mutex::into_inner)
  }

  fn stop(&self) -> Stop {
    Stop {
      token: self.cancel.clone(),
      deadline: self.options.timeout.map(|timeout| Instant::now() + timeout),
    }
  }

  async fn ensure_writable(&self) -> Result<(), ReconcileError> {
    if self.store.lock().await.is_writable() {
      Ok(())
    } else {
      Err(ReconcileError::ReadOnly)
    }
  }

  /// Converge the runtime to `declarations`.
  ///
  /// # Errors
  ///
  /// Configuration errors are returned before any runtime call. Runtime failures for
  /// individual resources are listed in the report instead.
  pub async fn reconcile(&self, declarations: &Declarations) -> Result<ReconciliationReport, ReconcileError> {
    self.ensure_writable().await?;

    let dag = ResourceDag::from_declarations(declarations)?;
    let desired = resolve::resolve_all(declarations, &dag)?;
    let records = self.store.lock().await.records().clone();
    let waves = ResourceDag::from_declarations(declarations)?
      .with_recorded_order(&records)?
      .execution_waves();

    info!(
      session = %self.session,
      resources = dag.len(),
      waves = waves.len(),
      parallelism = self.options.parallelism,
      "starting reconciliation"
    );

    let shared = Arc::new(Shared {
      runtime: self.runtime.clone(),
      store: self.store.clone(),
      session: self.session.clone(),
      seq: AtomicU64::new(0),
      displaced: Mutex::new(BTreeMap::new()),
      stop: self.stop(),
    });
    let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));

    let mut report = ReconciliationReport::new(&self.session);
    let mut bindings: BTreeMap<LogicalId, Binding> = BTreeMap::new();
    let mut blocked: BTreeSet<LogicalId> = BTreeSet::new();
    let mut aborted = false;

    for (wave_idx, wave) in waves.iter().enumerate() {
      let mut ready = Vec::new();

      for id in wave {
        let Some(item) = desired.get(id) else {
          continue;
        };
        let failed_dep = dag.dependencies(id).into_iter().find(|dep| blocked.contains(dep));

        let reason = if shared.stop.is_cancelled() {
          Some(SkipReason::Cancelled)
        } else if let Some(dep) = failed_dep {
          Some(SkipReason::DependencyFailed(dep))
        } else if aborted {
          Some(SkipReason::Aborted)
        } else {
          None
        };

        if let Some(reason) = reason {
          if reason == SkipReason::Cancelled {
            report.cancelled = true;
          }
          if item.kind().is_managed() {
            warn!(resource = %id, reason = %reason, "skipping resource");
            report.skip(item.kind(), id.clone(), reason);
          }
          blocked.insert(id.clone());
          continue;
        }

        if !item.kind().is_managed() {
          debug!(resource = %id, kind = %item.kind(), "inlined into dependents, nothing to reconcile");
          continue;
        }
        ready.push(item.clone());
      }

      if ready.is_empty() {
        continue;
      }

      debug!(wave = wave_idx, resources = ready.len(), "executing wave");
      let in_wave: Arc<BTreeSet<LogicalId>> = Arc::new(ready.iter().map(|d| d.logical_id().clone()).collect());

      for (id, kind, result) in run_wave(&shared, ready, &bindings, in_wave, semaphore.clone()).await {
        match result {
          Ok(Step::Done { outcome, entry, drifted }) => {
            bindings.insert(
              id.clone(),
              Binding {
                kind,
                name: entry.name.clone(),
                physical_id: entry.physical_id.clone(),
              },
            );
            if drifted {
              report.drifted.push(id);
            }
            report.record(outcome, entry);
          }
          Ok(Step::Cancelled) => {
            report.cancelled = true;
            report.skip(kind, id.clone(), SkipReason::Cancelled);
            blocked.insert(id);
          }
          Err(e) => {
            error!(resource = %id, kind = %kind, error = %e, "reconcile failed");
            report.fail(kind, id.clone(), &e);
            blocked.insert(id);
            aborted = true;
          }
        }
      }
    }

    // Undeclared dependents removed ahead of a replacement are gone for good.
    for (id, entry) in shared.displaced.lock().await.iter() {
      if !desired.contains_key(id) {
        report.record(Outcome::Deleted, entry.clone());
      }
    }

    if aborted || report.cancelled {
      info!("skipping removal of undeclared resources after an incomplete run");
    } else {
      self.delete_orphans(&shared, declarations, &mut report).await?;
    }

    report.sort();
    info!(
      created = report.created.len(),
      updated = report.updated.len(),
      recreated = report.recreated.len(),
      deleted = report.deleted.len(),
      unchanged = report.unchanged.len(),
      failed = report.failed.len(),
      skipped = report.skipped.len(),
      "reconciliation complete"
    );
    Ok(report)
  }

  /// Remove recorded resources that are no longer declared, dependents first.
  async fn delete_orphans(
    &self,
    shared: &Shared<R>,
    declarations: &Declarations,
    report: &mut ReconciliationReport,
  ) -> Result<(), ReconcileError> {
    let orphans: BTreeMap<LogicalId, StateRecord> = self
      .store
      .lock()
      .await
      .records()
      .iter()
      .filter(|(id, _)| !declarations.contains(id))
      .map(|(id, record)| (id.clone(), record.clone()))
      .collect();
    if orphans.is_empty() {
      return Ok(());
    }

    let order = ResourceDag::from_records(&orphans)?.deletion_order();
    info!(count = order.len(), "removing undeclared resources");
    remove_in_order(shared, &orphans, &order, report).await;
    Ok(())
  }
}

/// Remove `order` one at a time, tombstoning each record after its removal.
///
/// The first failure stops the sequence; cancellation is honoured between removals.
async fn remove_in_order<R: RuntimeClient>(
  shared: &Shared<R>,
  records: &BTreeMap<LogicalId, StateRecord>,
  order: &[LogicalId],
  report: &mut ReconciliationReport,
) {
  let mut stopped: Option<SkipReason> = None;

  for id in order {
    let Some(record) = records.get(id) else {
      continue;
    };
    if let Some(reason) = &stopped {
      report.skip(record.kind, id.clone(), reason.clone());
      continue;
    }
    if shared.stop.is_cancelled() {
      report.cancelled = true;
      report.skip(record.kind, id.clone(), SkipReason::Cancelled);
      stopped = Some(SkipReason::Cancelled);
      continue;
    }

    match shared.remove(record).await {
      Ok(seq) => {
        info!(resource = %id, kind = %record.kind, physical_id = %record.physical_id, "deleted");
        report.record(Outcome::Deleted, entry_for(record, seq));
      }
      Err(e) => {
        error!(resource = %id, kind = %record.kind, error = %e, "delete failed");
        report.fail(record.kind, id.clone(), &e);
        stopped = Some(SkipReason::Aborted);
      }
    }
  }
}

/// Result of converging one resource.
enum Step {
  Done {
    outcome: Outcome,
    entry: ReportEntry,
    drifted: bool,
  },
  /// The run was cancelled before the resource started.
  Cancelled,
}

/// Cancellation observed between resource operations.
#[derive(Debug, Clone)]
struct Stop {
  token: CancellationToken,
  deadline: Option<Instant>,
}

impl Stop {
  fn is_cancelled(&self) -> bool {
    self.token.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
  }
}

/// State shared by the tasks of one run.
struct Shared<R> {
  runtime: Arc<R>,
  store: Arc<Mutex<StateStore>>,
  session: String,
  /// Commit-order counter for report entries.
  seq: AtomicU64,
  /// Resources removed ahead of a dependency's replacement, keyed by logical id.
  displaced: Mutex<BTreeMap<LogicalId, ReportEntry>>,
  stop: Stop,
}

impl<R: RuntimeClient> Shared<R> {
  fn next_seq(&self) -> u64 {
    self.seq.fetch_add(1, Ordering::SeqCst) + 1
  }

  /// Persist a record; the returned sequence number reflects commit order.
  async fn commit(&self, record: StateRecord) -> Result<u64, ReconcileError> {
    let mut store = self.store.lock().await;
    store.put(record)?;
    Ok(self.next_seq())
  }

  /// Remove a recorded resource and tombstone its record.
  async fn remove(&self, record: &StateRecord) -> Result<u64, ReconcileError> {
    self
      .runtime
      .remove(record.kind, &record.physical_id)
      .await
      .map_err(runtime_error(record.kind, &record.logical_id))?;
    let mut store = self.store.lock().await;
    store.tombstone(&record.logical_id)?;
    Ok(self.next_seq())
  }

  async fn ensure(&self, spec: &ResourceSpec) -> Result<PhysicalId, ReconcileError> {
    self
      .runtime
      .ensure(spec)
      .await
      .map_err(runtime_error(spec.kind, &spec.logical_id))
  }

  /// Converge one declared resource.
  async fn converge(
    &self,
    desired: &Desired,
    current: &BTreeMap<LogicalId, Binding>,
    in_wave: &BTreeSet<LogicalId>,
  ) -> Result<Step, ReconcileError> {
    if self.stop.is_cancelled() {
      return Ok(Step::Cancelled);
    }

    let id = desired.logical_id();
    let kind = desired.kind();
    let spec = desired.spec(&self.session, current);
    let recorded = self.store.lock().await.get(id).cloned();
    let displaced = self.displaced.lock().await.remove(id).is_some();

    let Some(record) = recorded else {
      info!(resource = %id, kind = %kind, "creating");
      let physical_id = self.ensure(&spec).await?;
      let seq = self.commit(applied(desired, &spec, &physical_id)).await?;
      let outcome = if displaced { Outcome::Recreated } else { Outcome::Created };
      return Ok(done(outcome, desired, physical_id, seq, false));
    };

    if record.kind != kind {
      info!(resource = %id, from = %record.kind, to = %kind, "kind changed, recreating");
      return self.recreate(desired, &spec, &record, in_wave).await;
    }

    let stale = desired
      .bindings
      .iter()
      .find(|dep| record.bindings.get(*dep) != spec.bindings.get(*dep).map(|b| &b.physical_id));
    if let Some(dep) = stale {
      info!(resource = %id, dependency = %dep, "dependency has a new physical id, recreating");
      return self.recreate(desired, &spec, &record, in_wave).await;
    }

    if record.config_hash == desired.config_hash {
      return self.verify(desired, &spec, &record).await;
    }

    match self.runtime.update_policy(&spec, &record.config) {
      UpdatePolicy::InPlace => {
        let exists = self
          .runtime
          .inspect(kind, &record.physical_id)
          .await
          .map_err(runtime_error(kind, id))?;
        if exists.is_none() {
          return self.heal(desired, &spec).await;
        }

        info!(resource = %id, kind = %kind, "updating in place");
        let physical_id = self
          .runtime
          .update(&spec, &record.physical_id)
          .await
          .map_err(runtime_error(kind, id))?;
        let seq = self.commit(applied(desired, &spec, &physical_id)).await?;
        Ok(done(Outcome::Updated, desired, physical_id, seq, false))
      }
      UpdatePolicy::Recreate => {
        info!(resource = %id, kind = %kind, "configuration changed, recreating");
        self.recreate(desired, &spec, &record, in_wave).await
      }
    }
  }

  /// Confirm an unchanged resource still exists, creating it again if it drifted away.
  async fn verify(&self, desired: &Desired, spec: &ResourceSpec, record: &StateRecord) -> Result<Step, ReconcileError> {
    let found = self
      .runtime
      .inspect(record.kind, &record.physical_id)
      .await
      .map_err(runtime_error(record.kind, &record.logical_id))?;

    match found {
      Some(_) => {
        debug!(resource = %record.logical_id, "unchanged");
        Ok(done(
          Outcome::Unchanged,
          desired,
          record.physical_id.clone(),
          self.next_seq(),
          false,
        ))
      }
      None => self.heal(desired, spec).await,
    }
  }

  async fn heal(&self, desired: &Desired, spec: &ResourceSpec) -> Result<Step, ReconcileError> {
    warn!(resource = %spec.logical_id, kind = %spec.kind, "resource missing from runtime, creating it again");
    let physical_id = self.ensure(spec).await?;
    let seq = self.commit(applied(desired, spec, &physical_id)).await?;
    Ok(done(Outcome::Created, desired, physical_id, seq, true))
  }

  async fn recreate(
    &self,
    desired: &Desired,
    spec: &ResourceSpec,
    record: &StateRecord,
    in_wave: &BTreeSet<LogicalId>,
  ) -> Result<Step, ReconcileError> {
    // Images are created before the old one goes away; pulling the same content is a no-op.
    if record.kind == ResourceKind::Image && spec.kind == ResourceKind::Image {
      let physical_id = self.ensure(spec).await?;
      let seq = self.commit(applied(desired, spec, &physical_id)).await?;
      if physical_id == record.physical_id {
        debug!(resource = %record.logical_id, image = %physical_id, "image content unchanged");
        return Ok(done(Outcome::Updated, desired, physical_id, seq, false));
      }
      self.displace(&record.logical_id, in_wave).await?;
      if let Err(e) = self.runtime.remove(record.kind, &record.physical_id).await {
        warn!(image = %record.physical_id, error = %e, "failed to remove replaced image");
      }
      return Ok(done(Outcome::Recreated, desired, physical_id, seq, false));
    }

    self.displace(&record.logical_id, in_wave).await?;
    self.remove(record).await?;
    let physical_id = self.ensure(spec).await?;
    let seq = self.commit(applied(desired, spec, &physical_id)).await?;
    Ok(done(Outcome::Recreated, desired, physical_id, seq, false))
  }

  /// Remove every recorded resource embedding `id`'s physical id, deepest first.
  ///
  /// Recorded dependents run in later waves, so any dependent found in the current wave only
  /// reaches `id` through an edge that would have closed a cycle and is left alone.
  async fn displace(&self, id: &LogicalId, in_wave: &BTreeSet<LogicalId>) -> Result<(), ReconcileError> {
    let (dependents, records) = {
      let store = self.store.lock().await;
      let records = store.records().clone();
      (ResourceDag::from_records(&records)?.physical_dependents_of(id), records)
    };

    for dependent in dependents.iter().rev() {
      if in_wave.contains(dependent) {
        continue;
      }
      let Some(record) = records.get(dependent) else {
        continue;
      };
      info!(resource = %dependent, dependency = %id, "removing dependent ahead of replacement");
      let seq = self.remove(record).await?;
      self
        .displaced
        .lock()
        .await
        .insert(dependent.clone(), entry_for(record, seq));
    }
    Ok(())
  }
}

/// Run one wave with at most `semaphore` permits in flight.
async fn run_wave<R: RuntimeClient>(
  shared: &Arc<Shared<R>>,
  ready: Vec<Desired>,
  bindings: &BTreeMap<LogicalId, Binding>,
  in_wave: Arc<BTreeSet<LogicalId>>,
  semaphore: Arc<Semaphore>,
) -> Vec<(LogicalId, ResourceKind, Result<Step, ReconcileError>)> {
  let mut join_set = JoinSet::new();
  let mut tasks = HashMap::new();

  for desired in ready {
    let id = desired.logical_id().clone();
    let kind = desired.kind();
    let current: BTreeMap<LogicalId, Binding> = desired
      .bindings
      .iter()
      .filter_map(|dep| bindings.get(dep).map(|b| (dep.clone(), b.clone())))
      .collect();
    let shared = shared.clone();
    let semaphore = semaphore.clone();
    let in_wave = in_wave.clone();

    let handle = join_set.spawn(async move {
      let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| ReconcileError::Task(e.to_string()))?;
      shared.converge(&desired, &current, &in_wave).await
    });
    tasks.insert(handle.id(), (id, kind));
  }

  let mut results = Vec::with_capacity(tasks.len());
  while let Some(joined) = join_set.join_next_with_id().await {
    match joined {
      Ok((task, result)) => {
        if let Some((id, kind)) = tasks.remove(&task) {
          results.push((id, kind, result));
        }
      }
      Err(e) => {
        error!(error = %e, "reconcile task panicked");
        if let Some((id, kind)) = tasks.remove(&e.id()) {
          results.push((id, kind, Err(ReconcileError::Task(e.to_string()))));
        }
      }
    }
  }

  results
}

fn runtime_error(kind: ResourceKind, id: &LogicalId) -> impl FnOnce(RuntimeError) -> ReconcileError + '_ {
  move |source| ReconcileError::Runtime {
    kind,
    id: id.clone(),
    source,
  }
}

/// The record written after `desired` was applied as `physical_id`.
fn applied(desired: &Desired, spec: &ResourceSpec, physical_id: &str) -> StateRecord {
  StateRecord {
    logical_id: desired.logical_id().clone(),
    kind: desired.kind(),
    physical_id: physical_id.to_string(),
    name: desired.name.clone(),
    config_hash: desired.config_hash.clone(),
    config: desired.config.clone(),
    depends_on: desired
      .descriptor
      .references()
      .iter()
      .filter(|r| r.target.kind.is_managed())
      .map(|r| r.target.id.clone())
      .collect(),
    bindings: spec
      .bindings
      .iter()
      .map(|(id, binding)| (id.clone(), binding.physical_id.clone()))
      .collect(),
    applied_at: now_millis(),
  }
}

fn done(outcome: Outcome, desired: &Desired, physical_id: PhysicalId, seq: u64, drifted: bool) -> Step {
  Step::Done {
    outcome,
    entry: ReportEntry {
      logical_id: desired.logical_id().clone(),
      kind: desired.kind(),
      name: desired.name.clone(),
      physical_id,
      seq,
    },
    drifted,
  }
}

fn entry_for(record: &StateRecord, seq: u64) -> ReportEntry {
  ReportEntry {
    logical_id: record.logical_id.clone(),
    kind: record.kind,
    name: record.name.clone(),
    physical_id: record.physical_id.clone(),
    seq,
  }
}
