//! The ordered set of descriptors declared in one session.

use std::collections::HashMap;
use std::sync::Arc;

use super::descriptor::{Descriptor, DescriptorHandle};
use super::error::ConfigurationError;
use super::types::{Config, LogicalId, ResourceKind};

/// Descriptors in declaration order, indexed by logical id.
#[derive(Debug, Clone, Default)]
pub struct Declarations {
  descriptors: Vec<Arc<Descriptor>>,
  index: HashMap<LogicalId, usize>,
}

impl Declarations {
  pub fn new() -> Self {
    Self::default()
  }

  /// Validate and add a descriptor.
  pub fn declare(
    &mut self,
    kind: ResourceKind,
    logical_id: impl Into<LogicalId>,
    config: Config,
  ) -> Result<DescriptorHandle, ConfigurationError> {
    self.insert(Descriptor::new(kind, logical_id, config)?)
  }

  /// Add an already-constructed descriptor.
  pub fn insert(&mut self, descriptor: Descriptor) -> Result<DescriptorHandle, ConfigurationError> {
    if self.index.contains_key(descriptor.logical_id()) {
      return Err(ConfigurationError::DuplicateLogicalId(descriptor.logical_id().clone()));
    }
    let handle = descriptor.handle();
    self.index.insert(descriptor.logical_id().clone(), self.descriptors.len());
    self.descriptors.push(Arc::new(descriptor));
    Ok(handle)
  }

  /// Move every descriptor of `other` into this set.
  pub fn extend(&mut self, other: Declarations) -> Result<(), ConfigurationError> {
    for descriptor in other.descriptors {
      let descriptor = Arc::try_unwrap(descriptor).unwrap_or_else(|shared| (*shared).clone());
      self.insert(descriptor)?;
    }
    Ok(())
  }

  pub fn get(&self, id: &LogicalId) -> Option<&Arc<Descriptor>> {
    self.index.get(id).map(|&i| &self.descriptors[i])
  }

  pub fn contains(&self, id: &LogicalId) -> bool {
    self.index.contains_key(id)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<Descriptor>> {
    self.descriptors.iter()
  }

  pub fn len(&self) -> usize {
    self.descriptors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.descriptors.is_empty()
  }
}
