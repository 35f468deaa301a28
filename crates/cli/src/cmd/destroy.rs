//! Implementation of the `dockyard destroy` command.
//!
//! Removes every resource recorded for a session, dependents first.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use dockyard_lib::eval::evaluate_config;
use dockyard_lib::execute::ReconcileOptions;
use dockyard_lib::runtime::DockerRuntime;
use dockyard_lib::session::{Session, SessionOptions};

use super::{async_runtime, cancel_on_interrupt, connect};
use crate::output::{OutputFormat, print_info, print_json, print_plan, print_report, print_success};

pub struct DestroyArgs {
  pub file: Option<PathBuf>,
  pub session: Option<String>,
  pub dry_run: bool,
  pub timeout: Option<Duration>,
  pub docker_socket: Option<String>,
}

/// Returns whether every recorded resource was removed.
pub fn cmd_destroy(args: &DestroyArgs, format: OutputFormat) -> Result<bool> {
  let name = session_name(args)?;
  let options = SessionOptions::new(&name)
    .with_command(format!("dockyard destroy {}", name))
    .with_reconcile(ReconcileOptions {
      timeout: args.timeout,
      ..ReconcileOptions::default()
    });

  let rt = async_runtime()?;

  if args.dry_run {
    let plan = rt.block_on(async {
      let runtime = DockerRuntime::connect(args.docker_socket.as_deref()).context("Failed to connect to Docker")?;
      let session = Session::open_read_only(Arc::new(runtime), options).context("Failed to open session")?;
      session.plan_destroy().await.context("Plan failed")
    })?;

    if format.is_json() {
      print_json(&plan)?;
    } else if plan.changes.is_empty() {
      print_info(&format!("Session '{}' has no recorded resources", name));
    } else {
      print_plan(&plan, false);
    }
    return Ok(true);
  }

  let report = rt.block_on(async {
    let runtime = connect(args.docker_socket.as_deref()).await?;
    let session = Session::open(runtime, options).context("Failed to open session")?;
    cancel_on_interrupt(session.cancellation_token());
    session.destroy().await.context("Destroy failed")
  })?;

  if format.is_json() {
    print_json(&report)?;
  } else if report.total() == 0 {
    print_info(&format!("Session '{}' has no recorded resources", name));
  } else {
    print_report(&report, false);
    if report.is_success() {
      println!();
      print_success(&format!("Destroyed session '{}'", name));
    }
  }

  Ok(report.is_success())
}

fn session_name(args: &DestroyArgs) -> Result<String> {
  match (&args.file, &args.session) {
    (_, Some(session)) => Ok(session.clone()),
    (Some(file), None) => {
      let evaluated =
        evaluate_config(file, None).with_context(|| format!("Failed to evaluate config: {}", file.display()))?;
      Ok(evaluated.session)
    }
    (None, None) => bail!("destroy needs a declaration file or --session"),
  }
}
