//! Configuration errors, detected before any runtime call.

use thiserror::Error;

use super::types::{LogicalId, ResourceKind};

/// A problem with the declared resources themselves.
///
/// Every variant is raised while validating descriptors or building the dependency graph,
/// so a run that fails with a `ConfigurationError` has made zero runtime calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
  #[error("logical id '{0}' is declared more than once")]
  DuplicateLogicalId(LogicalId),

  #[error("invalid logical id '{0}': use letters, digits, '_', '.' or '-', starting with a letter or digit")]
  InvalidLogicalId(String),

  #[error("dependency cycle detected: {}", format_cycle(.cycle))]
  CyclicDependency { cycle: Vec<LogicalId> },

  #[error("'{from}' references '{target}', which is not declared")]
  UnresolvedReference { from: LogicalId, target: LogicalId },

  #[error("'{from}' references '{target}' as a {expected}, but it is declared as a {actual}")]
  KindMismatch {
    from: LogicalId,
    target: LogicalId,
    expected: ResourceKind,
    actual: ResourceKind,
  },

  #[error("{kind} '{id}': unknown option '{option}'")]
  UnknownOption {
    kind: ResourceKind,
    id: LogicalId,
    option: String,
  },

  #[error("{kind} '{id}': missing required option '{option}'")]
  MissingOption {
    kind: ResourceKind,
    id: LogicalId,
    option: String,
  },

  #[error("{kind} '{id}': option '{option}' {reason}")]
  InvalidOption {
    kind: ResourceKind,
    id: LogicalId,
    option: String,
    reason: String,
  },
}

fn format_cycle(cycle: &[LogicalId]) -> String {
  cycle.iter().map(LogicalId::as_str).collect::<Vec<_>>().join(" -> ")
}
