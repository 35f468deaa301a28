//! Persistent record of what physically exists for each session.
//!
//! # Storage Layout
//!
//! ```text
//! {state_root}/
//! └── <session>/
//!     ├── .lock         # StoreLock, held for the session's lifetime
//!     └── state.json    # StateFile: version, session, updated_at, records
//! ```

mod storage;
mod types;

pub use storage::{StateStore, is_valid_session_name, list_sessions};
pub(crate) use storage::now_millis;
pub use types::{RecordChanges, StateError, StateFile, StateRecord};
