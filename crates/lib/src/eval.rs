//! Declaration file evaluation.
//!
//! A declaration file returns a table with a `setup(ctx)` function and an optional
//! `session` name:
//!
//! ```lua
//! return {
//!   session = "web-stack",
//!   setup = function(ctx)
//!     local net = ctx.network("private", { internal = true })
//!     ctx.container("web", { image = "nginx:alpine", networking = { net } })
//!   end,
//! }
//! ```
//!
//! Without `session`, the session is named after the directory holding the file.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::prelude::*;
use tracing::{debug, info};

use crate::lua::{ctx, runtime};
use crate::resource::Declarations;
use crate::state::is_valid_session_name;

/// Errors that can occur while evaluating a declaration file.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
  #[error("lua error: {0}")]
  Lua(#[from] LuaError),

  #[error("cannot resolve '{path}': {source}")]
  Path {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid session name '{0}': use letters, digits, '_', '.' or '-'")]
  InvalidSession(String),
}

/// The result of evaluating a declaration file.
#[derive(Debug)]
pub struct Evaluated {
  pub session: String,
  pub declarations: Declarations,
  /// Directory of the declaration file; relative host paths were resolved against it.
  pub dir: PathBuf,
}

/// Evaluate the declaration file at `path`.
///
/// `session_override` replaces the session named by the file.
pub fn evaluate_config(path: &Path, session_override: Option<&str>) -> Result<Evaluated, EvalError> {
  let path = dunce::canonicalize(path).map_err(|source| EvalError::Path {
    path: path.to_path_buf(),
    source,
  })?;
  let dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
  let declarations = Rc::new(RefCell::new(Declarations::new()));

  let session = {
    let lua = runtime::create_runtime(&dir)?;
    let LuaValue::Table(config) = runtime::load_file(&lua, &path)? else {
      return Err(LuaError::external("declaration file must return a table with a 'setup' function").into());
    };

    let session = match session_override {
      Some(name) => name.to_string(),
      None => match config.get::<Option<String>>("session")? {
        Some(name) => name,
        None => default_session(&dir),
      },
    };
    if !is_valid_session_name(&session) {
      return Err(EvalError::InvalidSession(session));
    }

    let setup: LuaFunction = config
      .get("setup")
      .map_err(|_| LuaError::external("declaration file must return a table with a 'setup' function"))?;

    debug!(path = %path.display(), session = %session, "calling setup");
    let ctx = ctx::create_ctx(&lua, declarations.clone(), &dir, &session)?;
    setup.call::<()>(ctx)?;
    session
  };

  let declarations = std::mem::take(&mut *declarations.borrow_mut());
  info!(session = %session, resources = declarations.len(), "evaluated declarations");

  Ok(Evaluated {
    session,
    declarations,
    dir,
  })
}

fn default_session(dir: &Path) -> String {
  dir
    .file_name()
    .map(|name| name.to_string_lossy().to_string())
    .unwrap_or_else(|| "default".to_string())
}
