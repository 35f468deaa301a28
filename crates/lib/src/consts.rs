//! Constants shared across the crate.

/// Application name, used for data directories and runtime labels.
pub const APP_NAME: &str = "dockyard";

/// Length of the truncated hex digest used for configuration hashes.
pub const CONFIG_HASH_PREFIX_LEN: usize = 20;

/// Environment variable overriding the state root directory.
pub const STATE_DIR_ENV: &str = "DOCKYARD_STATE_DIR";

/// Current on-disk state file format version.
pub const STATE_VERSION: u32 = 1;

/// Default number of resources reconciled concurrently.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Label keys attached to every resource the Docker runtime creates.
pub const LABEL_SESSION: &str = "dockyard.session";
pub const LABEL_LOGICAL_ID: &str = "dockyard.logical-id";
pub const LABEL_CONFIG_HASH: &str = "dockyard.config-hash";

/// Metatable marker for resource handles in Lua.
pub const REF_TYPE: &str = "dockyard.ref";

/// Metatable marker for string templates in Lua.
pub const TEMPLATE_TYPE: &str = "dockyard.template";
