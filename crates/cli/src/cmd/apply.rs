//! Implementation of the `dockyard apply` command.
//!
//! Evaluates a declaration file and reconciles Docker against it, then prints the report.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;

use dockyard_lib::eval::evaluate_config;
use dockyard_lib::execute::ReconcileOptions;
use dockyard_lib::session::{Session, SessionOptions};

use super::{async_runtime, cancel_on_interrupt, connect};
use crate::output::{OutputFormat, format_duration, print_info, print_json, print_report, print_success};

pub struct ApplyArgs {
  pub file: PathBuf,
  pub session: Option<String>,
  pub parallelism: usize,
  pub timeout: Option<Duration>,
  pub docker_socket: Option<String>,
  pub verbose: bool,
}

/// Returns whether every declared resource converged.
pub fn cmd_apply(args: &ApplyArgs, format: OutputFormat) -> Result<bool> {
  let evaluated = evaluate_config(&args.file, args.session.as_deref())
    .with_context(|| format!("Failed to evaluate config: {}", args.file.display()))?;

  let options = SessionOptions::new(&evaluated.session)
    .with_command(format!("dockyard apply {}", args.file.display()))
    .with_reconcile(ReconcileOptions {
      parallelism: args.parallelism,
      timeout: args.timeout,
    });

  let started = Instant::now();
  let rt = async_runtime()?;
  let report = rt.block_on(async {
    let runtime = connect(args.docker_socket.as_deref()).await?;
    let mut session = Session::open(runtime, options).context("Failed to open session")?;
    session.extend(evaluated.declarations)?;
    cancel_on_interrupt(session.cancellation_token());

    info!(session = %session.name(), "applying");
    session.finalize().await.context("Apply failed")
  })?;

  if format.is_json() {
    print_json(&report)?;
  } else {
    if report.total() == 0 {
      print_info(&format!("Session '{}' has nothing declared or recorded", report.session));
    } else {
      print_report(&report, args.verbose);
    }
    if report.is_success() {
      println!();
      print_success(&format!(
        "Applied session '{}' in {}",
        report.session,
        format_duration(started.elapsed())
      ));
    }
  }

  Ok(report.is_success())
}
