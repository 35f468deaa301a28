//! Sessions: the caller-facing entry point.
//!
//! A [`Session`] holds the exclusive lock on one session's state for its whole lifetime,
//! collects declarations, and hands them to a [`Reconciler`] on [`Session::finalize`].
//!
//! ```ignore
//! let mut session = Session::open(runtime, SessionOptions::new("web-stack"))?;
//! let net = session.network("n1", Config::new())?;
//! session.container("c1", Config::new().with("image", "nginx:alpine").with("networking", vec![net.reference()]))?;
//! let report = session.finalize().await?;
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::execute::{Plan, ReconcileError, ReconcileOptions, ReconciliationReport, Reconciler};
use crate::platform::paths::state_root;
use crate::resource::{Config, ConfigurationError, Declarations, DescriptorHandle, LogicalId, ResourceKind};
use crate::runtime::RuntimeClient;
use crate::state::{StateError, StateRecord, StateStore};
use crate::store_lock::LockMode;

#[derive(Debug, Error)]
pub enum SessionError {
  #[error(transparent)]
  Configuration(#[from] ConfigurationError),

  #[error(transparent)]
  StoreLocked(StateError),

  #[error(transparent)]
  State(StateError),

  #[error(transparent)]
  Reconcile(#[from] ReconcileError),
}

impl From<StateError> for SessionError {
  fn from(err: StateError) -> Self {
    if err.is_locked() {
      SessionError::StoreLocked(err)
    } else {
      SessionError::State(err)
    }
  }
}

/// Where a session keeps its state and how it reconciles.
#[derive(Debug, Clone)]
pub struct SessionOptions {
  pub name: String,
  pub state_root: PathBuf,
  /// Recorded in the lock file so contention errors name the holder.
  pub command: String,
  pub reconcile: ReconcileOptions,
}

impl SessionOptions {
  /// Options for `name` under the default state root.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      state_root: state_root(),
      command: "dockyard".to_string(),
      reconcile: ReconcileOptions::default(),
    }
  }

  pub fn with_state_root(mut self, state_root: impl Into<PathBuf>) -> Self {
    self.state_root = state_root.into();
    self
  }

  pub fn with_command(mut self, command: impl Into<String>) -> Self {
    self.command = command.into();
    self
  }

  pub fn with_reconcile(mut self, reconcile: ReconcileOptions) -> Self {
    self.reconcile = reconcile;
    self
  }
}

/// Declarations for one session, plus the reconciler that applies them.
pub struct Session<R: RuntimeClient> {
  reconciler: Reconciler<R>,
  declarations: Declarations,
}

impl<R: RuntimeClient> Session<R> {
  /// Open a session for reconciliation, taking its exclusive lock.
  ///
  /// Fails with [`SessionError::StoreLocked`] if another process holds the session.
  pub fn open(runtime: Arc<R>, options: SessionOptions) -> Result<Self, SessionError> {
    Self::open_with(runtime, options, LockMode::Exclusive)
  }

  /// Open a session for planning and status only.
  ///
  /// Read-only sessions can coexist with each other but not with an exclusive holder.
  /// [`Session::finalize`] and [`Session::destroy`] fail on them.
  pub fn open_read_only(runtime: Arc<R>, options: SessionOptions) -> Result<Self, SessionError> {
    Self::open_with(runtime, options, LockMode::Shared)
  }

  fn open_with(runtime: Arc<R>, options: SessionOptions, mode: LockMode) -> Result<Self, SessionError> {
    let store = StateStore::open(&options.state_root, &options.name, mode, &options.command)?;
    Ok(Self {
      reconciler: Reconciler::new(runtime, store).with_options(options.reconcile),
      declarations: Declarations::new(),
    })
  }

  pub fn name(&self) -> &str {
    self.reconciler.session()
  }

  /// Declare a resource of any kind.
  pub fn declare(
    &mut self,
    kind: ResourceKind,
    logical_id: impl Into<LogicalId>,
    config: Config,
  ) -> Result<DescriptorHandle, SessionError> {
    Ok(self.declarations.declare(kind, logical_id, config)?)
  }

  pub fn image(&mut self, logical_id: impl Into<LogicalId>, config: Config) -> Result<DescriptorHandle, SessionError> {
    self.declare(ResourceKind::Image, logical_id, config)
  }

  pub fn network(&mut self, logical_id: impl Into<LogicalId>, config: Config) -> Result<DescriptorHandle, SessionError> {
    self.declare(ResourceKind::Network, logical_id, config)
  }

  pub fn volume(&mut self, logical_id: impl Into<LogicalId>, config: Config) -> Result<DescriptorHandle, SessionError> {
    self.declare(ResourceKind::Volume, logical_id, config)
  }

  pub fn container(
    &mut self,
    logical_id: impl Into<LogicalId>,
    config: Config,
  ) -> Result<DescriptorHandle, SessionError> {
    self.declare(ResourceKind::Container, logical_id, config)
  }

  pub fn mount(&mut self, logical_id: impl Into<LogicalId>, config: Config) -> Result<DescriptorHandle, SessionError> {
    self.declare(ResourceKind::Mount, logical_id, config)
  }

  /// Add declarations built elsewhere, such as by evaluating a declaration file.
  pub fn extend(&mut self, declarations: Declarations) -> Result<(), SessionError> {
    Ok(self.declarations.extend(declarations)?)
  }

  pub fn declarations(&self) -> &Declarations {
    &self.declarations
  }

  /// Token that cancels an in-progress [`Session::finalize`] or [`Session::destroy`].
  pub fn cancellation_token(&self) -> CancellationToken {
    self.reconciler.cancellation_token()
  }

  /// What is recorded for this session right now.
  pub async fn records(&self) -> BTreeMap<LogicalId, StateRecord> {
    self.reconciler.records().await
  }

  /// What [`Session::finalize`] would do, without changing anything.
  pub async fn plan(&self) -> Result<Plan, SessionError> {
    Ok(self.reconciler.plan(&self.declarations).await?)
  }

  /// What [`Session::destroy`] would remove.
  pub async fn plan_destroy(&self) -> Result<Plan, SessionError> {
    Ok(self.reconciler.plan_destroy().await?)
  }

  /// Reconcile the declared resources, then release the session.
  ///
  /// Resources recorded by earlier runs but not declared now are deleted.
  pub async fn finalize(self) -> Result<ReconciliationReport, SessionError> {
    Ok(self.reconciler.reconcile(&self.declarations).await?)
  }

  /// Remove everything recorded for the session, then release it.
  pub async fn destroy(self) -> Result<ReconciliationReport, SessionError> {
    Ok(self.reconciler.destroy().await?)
  }
}
