//! Resource descriptors and the handles callers use to reference them.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::error::ConfigurationError;
use super::options;
use super::types::{Config, ConfigValue, LogicalId, RefMode, ResourceKind, ResourceRef, TemplatePart};

/// A dependency edge discovered in a descriptor's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
  pub target: ResourceRef,
  pub mode: RefMode,
}

/// The declared intent for one resource.
///
/// Descriptors are validated on construction and immutable afterwards. Dependency edges are
/// derived by scanning the configuration for references; explicit ordering edges can be added
/// with [`Descriptor::with_dependency`] before the descriptor is declared.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
  kind: ResourceKind,
  logical_id: LogicalId,
  config: Config,
  references: Vec<Reference>,
}

impl Descriptor {
  pub fn new(kind: ResourceKind, logical_id: impl Into<LogicalId>, config: Config) -> Result<Self, ConfigurationError> {
    let logical_id = logical_id.into();
    if !logical_id.is_valid() {
      return Err(ConfigurationError::InvalidLogicalId(logical_id.0));
    }

    options::validate(kind, &logical_id, &config)?;

    let mut references = BTreeSet::new();
    for (_, value) in config.iter() {
      value.visit_refs(&mut |target, mode| {
        references.insert(Reference {
          target: target.clone(),
          mode,
        });
      });
    }

    Ok(Self {
      kind,
      logical_id,
      config,
      references: references.into_iter().collect(),
    })
  }

  /// Add an explicit ordering dependency on another descriptor.
  pub fn with_dependency(mut self, target: ResourceRef) -> Self {
    let reference = Reference {
      target,
      mode: RefMode::Order,
    };
    if !self.references.contains(&reference) {
      self.references.push(reference);
    }
    self
  }

  pub fn kind(&self) -> ResourceKind {
    self.kind
  }

  pub fn logical_id(&self) -> &LogicalId {
    &self.logical_id
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Every reference this descriptor holds, including explicit ordering edges.
  pub fn references(&self) -> &[Reference] {
    &self.references
  }

  /// Logical ids this descriptor depends on.
  pub fn depends_on(&self) -> BTreeSet<LogicalId> {
    self.references.iter().map(|r| r.target.id.clone()).collect()
  }

  /// The name the runtime knows this resource by.
  ///
  /// Images are named by their reference; other kinds use the `name` option and fall back to
  /// the logical id.
  pub fn runtime_name(&self) -> String {
    let key = match self.kind {
      ResourceKind::Image => "ref",
      _ => "name",
    };
    match self.config.get(key) {
      Some(ConfigValue::String(name)) => name.clone(),
      _ => self.logical_id.0.clone(),
    }
  }

  pub fn handle(&self) -> DescriptorHandle {
    DescriptorHandle {
      kind: self.kind,
      logical_id: self.logical_id.clone(),
      name: self.runtime_name(),
    }
  }
}

/// Returned by `declare`; lets later declarations reference this resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorHandle {
  kind: ResourceKind,
  logical_id: LogicalId,
  name: String,
}

impl DescriptorHandle {
  pub fn kind(&self) -> ResourceKind {
    self.kind
  }

  pub fn logical_id(&self) -> &LogicalId {
    &self.logical_id
  }

  /// The runtime name known at declaration time.
  pub fn runtime_name(&self) -> &str {
    &self.name
  }

  pub fn to_ref(&self) -> ResourceRef {
    ResourceRef::new(self.kind, self.logical_id.clone())
  }

  /// A reference that hands this resource's physical identity to the dependent.
  pub fn reference(&self) -> ConfigValue {
    ConfigValue::Ref(self.to_ref())
  }

  /// A template part rendering to this resource's name.
  pub fn name(&self) -> TemplatePart {
    TemplatePart::Name(self.to_ref())
  }
}

impl From<&DescriptorHandle> for ConfigValue {
  fn from(handle: &DescriptorHandle) -> Self {
    handle.reference()
  }
}

impl From<DescriptorHandle> for ConfigValue {
  fn from(handle: DescriptorHandle) -> Self {
    handle.reference()
  }
}
