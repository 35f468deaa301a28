//! Runtime clients: the boundary between the reconciler and a container runtime.
//!
//! The reconciler only talks to a [`RuntimeClient`]. [`DockerRuntime`] drives a Docker daemon
//! through `bollard`; [`MemoryRuntime`] keeps resources in memory and records every call.

mod docker;
mod memory;
mod types;

use std::collections::BTreeMap;
use std::future::Future;

use serde_json::Value;

use crate::resource::ResourceKind;
use crate::resource::options::in_place_options;

pub use docker::DockerRuntime;
pub use memory::{MemoryResource, MemoryRuntime, Operation, RuntimeCall};
pub use types::{
  Binding, PhysicalId, PhysicalState, REF_KEY, ResourceSpec, RuntimeError, UpdatePolicy, decode_ref, encode_ref,
};

/// Capabilities the reconciler needs from a container runtime.
///
/// # Error Handling
///
/// - **Not found**: `inspect` returns `Ok(None)` and `remove` succeeds
/// - **Connection failures**: `RuntimeError::Unavailable`
/// - **Refused operations**: `RuntimeError::Rejected`
pub trait RuntimeClient: Send + Sync + 'static {
  /// Check that the runtime is reachable.
  fn ping(&self) -> impl Future<Output = Result<(), RuntimeError>> + Send;

  /// Create the resource described by `spec`, or adopt an identical one left behind by an
  /// interrupted run. Returns the physical id.
  fn ensure(&self, spec: &ResourceSpec) -> impl Future<Output = Result<PhysicalId, RuntimeError>> + Send;

  /// Look up a resource by physical id.
  fn inspect(
    &self,
    kind: ResourceKind,
    physical_id: &str,
  ) -> impl Future<Output = Result<Option<PhysicalState>, RuntimeError>> + Send;

  /// Apply an in-place change. Only called when [`RuntimeClient::update_policy`] says `InPlace`.
  fn update(
    &self,
    spec: &ResourceSpec,
    physical_id: &str,
  ) -> impl Future<Output = Result<PhysicalId, RuntimeError>> + Send;

  /// Remove a resource. Removing something that no longer exists is not an error.
  fn remove(&self, kind: ResourceKind, physical_id: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

  /// Decide whether moving from `previous` to `spec.config` can happen in place.
  fn update_policy(&self, spec: &ResourceSpec, previous: &BTreeMap<String, Value>) -> UpdatePolicy {
    default_update_policy(spec.kind, &spec.config, previous)
  }
}

/// `InPlace` when every changed option is one the kind can change without recreating.
pub fn default_update_policy(
  kind: ResourceKind,
  next: &BTreeMap<String, Value>,
  previous: &BTreeMap<String, Value>,
) -> UpdatePolicy {
  let allowed = in_place_options(kind);
  let changed = next
    .keys()
    .chain(previous.keys())
    .filter(|key| next.get(*key) != previous.get(*key));

  let mut any = false;
  for key in changed {
    if !allowed.contains(&key.as_str()) {
      return UpdatePolicy::Recreate;
    }
    any = true;
  }

  if any { UpdatePolicy::InPlace } else { UpdatePolicy::Recreate }
}
