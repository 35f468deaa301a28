//! Resource declarations: kinds, option bags, descriptors and handles.

mod declarations;
mod descriptor;
mod error;
pub mod options;
mod types;

pub use declarations::Declarations;
pub use descriptor::{Descriptor, DescriptorHandle, Reference};
pub use error::ConfigurationError;
pub use types::{Config, ConfigValue, LogicalId, RefMode, ResourceKind, ResourceRef, TemplatePart};
