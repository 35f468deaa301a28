//! Values exchanged between the reconciler and a runtime client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::resource::{LogicalId, ResourceKind};
use crate::util::hash::ConfigHash;

/// Runtime-assigned identity of a resource. Opaque to the reconciler.
pub type PhysicalId = String;

/// Key marking a reference object inside canonical configuration.
pub const REF_KEY: &str = "$ref";

/// Encode a reference for canonical configuration.
///
/// Only kind, logical id and name are embedded, never the physical id, so the configuration
/// hash is stable across recreations of the dependency.
pub fn encode_ref(kind: ResourceKind, id: &LogicalId, name: &str) -> Value {
  serde_json::json!({ REF_KEY: { "kind": kind, "id": id, "name": name } })
}

/// Decode a reference produced by [`encode_ref`].
pub fn decode_ref(value: &Value) -> Option<(ResourceKind, LogicalId)> {
  let inner = value.as_object()?.get(REF_KEY)?;
  let kind = serde_json::from_value(inner.get("kind")?.clone()).ok()?;
  let id = inner.get("id")?.as_str()?;
  Some((kind, LogicalId::from(id)))
}

/// A dependency's identity at the time its dependent is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
  pub kind: ResourceKind,
  pub name: String,
  pub physical_id: PhysicalId,
}

/// Everything a runtime needs to create or update one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
  pub session: String,
  pub kind: ResourceKind,
  pub logical_id: LogicalId,
  /// Name the runtime should give the resource.
  pub name: String,
  /// Canonical configuration: references encoded with [`encode_ref`], templates rendered,
  /// mounts inlined.
  pub config: BTreeMap<String, Value>,
  pub config_hash: ConfigHash,
  /// Current physical identity of every `Ref` dependency.
  pub bindings: BTreeMap<LogicalId, Binding>,
}

impl ResourceSpec {
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.config.get(key)
  }

  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.config.get(key).and_then(Value::as_str)
  }

  /// Resolve an encoded reference to its binding.
  pub fn resolve(&self, value: &Value) -> Result<&Binding, RuntimeError> {
    let (_, id) = decode_ref(value).ok_or_else(|| RuntimeError::Rejected(format!("'{}' is not a reference", value)))?;
    self
      .bindings
      .get(&id)
      .ok_or_else(|| RuntimeError::Rejected(format!("no physical binding for dependency '{}'", id)))
  }
}

/// What a runtime reports about an existing resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalState {
  pub physical_id: PhysicalId,
  pub name: String,
  /// Lifecycle status for containers (`running`, `exited`, ...).
  pub status: Option<String>,
  pub labels: BTreeMap<String, String>,
}

/// How a configuration change is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePolicy {
  InPlace,
  Recreate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
  /// The runtime could not be reached. Transient: the whole run may be retried.
  #[error("container runtime unavailable: {0}")]
  Unavailable(String),

  /// The runtime refused the operation. Not retried.
  #[error("runtime rejected operation: {0}")]
  Rejected(String),
}

impl RuntimeError {
  pub fn is_transient(&self) -> bool {
    matches!(self, RuntimeError::Unavailable(_))
  }
}
