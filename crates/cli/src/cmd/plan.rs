//! Implementation of the `dockyard plan` command.
//!
//! Evaluates a declaration file and shows what `apply` would change. Only inspects the
//! runtime; takes the session's shared lock.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use dockyard_lib::eval::evaluate_config;
use dockyard_lib::runtime::DockerRuntime;
use dockyard_lib::session::{Session, SessionOptions};

use super::async_runtime;
use crate::output::{OutputFormat, print_info, print_json, print_plan};

pub struct PlanArgs {
  pub file: PathBuf,
  pub session: Option<String>,
  pub docker_socket: Option<String>,
  pub verbose: bool,
}

pub fn cmd_plan(args: &PlanArgs, format: OutputFormat) -> Result<()> {
  let evaluated = evaluate_config(&args.file, args.session.as_deref())
    .with_context(|| format!("Failed to evaluate config: {}", args.file.display()))?;

  let options = SessionOptions::new(&evaluated.session).with_command(format!("dockyard plan {}", args.file.display()));
  let rt = async_runtime()?;
  let plan = rt.block_on(async {
    let runtime = DockerRuntime::connect(args.docker_socket.as_deref()).context("Failed to connect to Docker")?;
    let mut session = Session::open_read_only(Arc::new(runtime), options).context("Failed to open session")?;
    session.extend(evaluated.declarations)?;
    session.plan().await.context("Plan failed")
  })?;

  if format.is_json() {
    return print_json(&plan);
  }

  if plan.has_changes() {
    print_plan(&plan, args.verbose);
  } else {
    print_info(&format!("Session '{}' is up to date", plan.session));
  }
  Ok(())
}
