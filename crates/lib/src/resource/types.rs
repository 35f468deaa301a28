//! Core value types for resource declarations.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kinds of Docker resources the reconciler understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
  Image,
  Container,
  Network,
  Volume,
  /// Bind or tmpfs mount. Inlined into the containers that use it, never created on its own.
  Mount,
}

impl ResourceKind {
  pub const ALL: [ResourceKind; 5] = [
    ResourceKind::Image,
    ResourceKind::Container,
    ResourceKind::Network,
    ResourceKind::Volume,
    ResourceKind::Mount,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceKind::Image => "image",
      ResourceKind::Container => "container",
      ResourceKind::Network => "network",
      ResourceKind::Volume => "volume",
      ResourceKind::Mount => "mount",
    }
  }

  /// Whether resources of this kind exist in the runtime and carry a state record.
  pub fn is_managed(&self) -> bool {
    !matches!(self, ResourceKind::Mount)
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ResourceKind::ALL
      .into_iter()
      .find(|kind| kind.as_str() == s)
      .ok_or_else(|| format!("unknown resource kind '{}'", s))
  }
}

/// Caller-chosen identifier of a resource, unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalId(pub String);

impl LogicalId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Logical ids double as default runtime names, so they follow Docker's naming rules:
  /// an alphanumeric first character followed by alphanumerics, `_`, `.` or `-`.
  pub fn is_valid(&self) -> bool {
    let mut chars = self.0.chars();
    match chars.next() {
      Some(first) if first.is_ascii_alphanumeric() => {}
      _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
  }
}

impl fmt::Display for LogicalId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for LogicalId {
  fn from(value: &str) -> Self {
    Self(value.to_string())
  }
}

impl From<String> for LogicalId {
  fn from(value: String) -> Self {
    Self(value)
  }
}

/// A typed pointer at another descriptor in the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
  pub kind: ResourceKind,
  pub id: LogicalId,
}

impl ResourceRef {
  pub fn new(kind: ResourceKind, id: impl Into<LogicalId>) -> Self {
    Self { kind, id: id.into() }
  }
}

impl fmt::Display for ResourceRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.kind, self.id)
  }
}

/// One segment of a [`ConfigValue::Template`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplatePart {
  Text(String),
  /// Renders to the runtime name of the referenced resource.
  Name(ResourceRef),
}

/// A configuration option value.
///
/// `Ref` values hand the dependency's physical identity to the runtime, while `Template`
/// values render dependency names into strings (hostnames inside a connection URL, say).
/// Both create dependency edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigValue {
  String(String),
  Integer(i64),
  Float(f64),
  Bool(bool),
  List(Vec<ConfigValue>),
  Map(BTreeMap<String, ConfigValue>),
  Ref(ResourceRef),
  Template(Vec<TemplatePart>),
}

impl ConfigValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      ConfigValue::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      ConfigValue::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_map(&self) -> Option<&BTreeMap<String, ConfigValue>> {
    match self {
      ConfigValue::Map(map) => Some(map),
      _ => None,
    }
  }

  pub fn as_resource_ref(&self) -> Option<&ResourceRef> {
    match self {
      ConfigValue::Ref(r) => Some(r),
      _ => None,
    }
  }

  /// Short name of the value's shape, used in validation messages.
  pub fn type_name(&self) -> &'static str {
    match self {
      ConfigValue::String(_) => "string",
      ConfigValue::Integer(_) => "integer",
      ConfigValue::Float(_) => "number",
      ConfigValue::Bool(_) => "boolean",
      ConfigValue::List(_) => "list",
      ConfigValue::Map(_) => "map",
      ConfigValue::Ref(_) => "resource reference",
      ConfigValue::Template(_) => "template",
    }
  }

  /// Build a map value from key/value pairs.
  pub fn map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
  where
    K: Into<String>,
    V: Into<ConfigValue>,
  {
    ConfigValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
  }

  /// Build a list value.
  pub fn list<V: Into<ConfigValue>>(items: impl IntoIterator<Item = V>) -> Self {
    ConfigValue::List(items.into_iter().map(Into::into).collect())
  }

  /// Visit every reference held by this value, recursing into lists, maps and templates.
  pub fn visit_refs<F: FnMut(&ResourceRef, RefMode)>(&self, f: &mut F) {
    match self {
      ConfigValue::Ref(r) => f(r, RefMode::Physical),
      ConfigValue::Template(parts) => {
        for part in parts {
          if let TemplatePart::Name(r) = part {
            f(r, RefMode::Name);
          }
        }
      }
      ConfigValue::List(items) => items.iter().for_each(|item| item.visit_refs(f)),
      ConfigValue::Map(map) => map.values().for_each(|value| value.visit_refs(f)),
      ConfigValue::String(_) | ConfigValue::Integer(_) | ConfigValue::Float(_) | ConfigValue::Bool(_) => {}
    }
  }
}

/// How a dependent consumes a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefMode {
  /// The dependent embeds the dependency's physical id; a new id invalidates the dependent.
  Physical,
  /// The dependent only renders the dependency's name.
  Name,
  /// Explicit ordering edge with no data flow.
  Order,
}

impl From<&str> for ConfigValue {
  fn from(value: &str) -> Self {
    ConfigValue::String(value.to_string())
  }
}

impl From<String> for ConfigValue {
  fn from(value: String) -> Self {
    ConfigValue::String(value)
  }
}

impl From<i64> for ConfigValue {
  fn from(value: i64) -> Self {
    ConfigValue::Integer(value)
  }
}

impl From<i32> for ConfigValue {
  fn from(value: i32) -> Self {
    ConfigValue::Integer(value.into())
  }
}

impl From<f64> for ConfigValue {
  fn from(value: f64) -> Self {
    ConfigValue::Float(value)
  }
}

impl From<bool> for ConfigValue {
  fn from(value: bool) -> Self {
    ConfigValue::Bool(value)
  }
}

impl From<ResourceRef> for ConfigValue {
  fn from(value: ResourceRef) -> Self {
    ConfigValue::Ref(value)
  }
}

impl From<Vec<ConfigValue>> for ConfigValue {
  fn from(value: Vec<ConfigValue>) -> Self {
    ConfigValue::List(value)
  }
}

impl From<Vec<TemplatePart>> for ConfigValue {
  fn from(value: Vec<TemplatePart>) -> Self {
    ConfigValue::Template(value)
  }
}

/// A descriptor's option bag, keyed by option name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config(BTreeMap<String, ConfigValue>);

impl Config {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style insert.
  pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
    self.0.insert(key.into(), value.into());
    self
  }

  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Option<ConfigValue> {
    self.0.insert(key.into(), value.into())
  }

  pub fn get(&self, key: &str) -> Option<&ConfigValue> {
    self.0.get(key)
  }

  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.get(key).and_then(ConfigValue::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
    self.0.iter()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl<K: Into<String>, V: Into<ConfigValue>> FromIterator<(K, V)> for Config {
  fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
    Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
  }
}

impl From<BTreeMap<String, ConfigValue>> for Config {
  fn from(value: BTreeMap<String, ConfigValue>) -> Self {
    Self(value)
  }
}
