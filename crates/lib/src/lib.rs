//! dockyard-lib: declarative reconciliation of Docker resources.
//!
//! Callers declare images, networks, volumes, containers and mounts in a [`session::Session`]
//! (or a Lua declaration file evaluated by [`eval`]). The [`execute::Reconciler`] diffs those
//! declarations against the session's recorded state and drives a [`runtime::RuntimeClient`]
//! until the runtime matches:
//! - `resource`: kinds, option bags, descriptors and handles
//! - `execute`: dependency graph, planning, reconciliation and teardown
//! - `runtime`: the Docker client and an in-memory client for tests
//! - `state`: per-session state records, persisted atomically

pub mod consts;
pub mod eval;
pub mod execute;
pub mod lua;
pub mod platform;
pub mod resource;
pub mod runtime;
pub mod session;
pub mod state;
pub mod store_lock;
pub mod util;

pub use execute::{Plan, ReconcileOptions, ReconciliationReport, Reconciler};
pub use resource::{Config, ConfigValue, Declarations, DescriptorHandle, ResourceKind};
pub use session::{Session, SessionError, SessionOptions};
