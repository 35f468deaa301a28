//! Lua evaluation of declaration files.
//!
//! - [`runtime`] - VM creation and file loading
//! - [`ctx`] - the `ctx` table passed to `setup(ctx)`
//! - [`convert`] - Lua option tables to [`crate::resource::Config`]

pub mod convert;
pub mod ctx;
pub mod runtime;
