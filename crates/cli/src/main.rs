mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dockyard_lib::consts::DEFAULT_PARALLELISM;

use cmd::{ApplyArgs, DestroyArgs, PlanArgs};
use output::{OutputFormat, print_error};

/// dockyard - declarative Docker resource reconciliation
#[derive(Parser)]
#[command(name = "dockyard")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  /// Log filter used when RUST_LOG is not set (e.g. "info", "dockyard_lib=debug")
  #[arg(long, global = true, default_value = "warn")]
  log_level: String,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Reconcile Docker against a declaration file
  Apply {
    /// Path to the declaration file
    file: PathBuf,

    /// Session name (overrides the file's `session`)
    #[arg(long)]
    session: Option<String>,

    /// Maximum number of resources reconciled at once
    #[arg(short = 'j', long, default_value_t = DEFAULT_PARALLELISM)]
    parallelism: usize,

    /// Stop starting new operations after this long (e.g. "5m", "90s")
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Docker socket path (defaults to DOCKER_HOST or the platform socket)
    #[arg(long)]
    docker_socket: Option<String>,

    /// Also list unchanged resources
    #[arg(short, long)]
    verbose: bool,
  },

  /// Show what apply would change, without changing anything
  Plan {
    /// Path to the declaration file
    file: PathBuf,

    /// Session name (overrides the file's `session`)
    #[arg(long)]
    session: Option<String>,

    /// Docker socket path (defaults to DOCKER_HOST or the platform socket)
    #[arg(long)]
    docker_socket: Option<String>,

    /// Also list unchanged resources
    #[arg(short, long)]
    verbose: bool,
  },

  /// Remove every resource recorded for a session
  Destroy {
    /// Declaration file naming the session
    #[arg(required_unless_present = "session")]
    file: Option<PathBuf>,

    /// Session to destroy
    #[arg(long)]
    session: Option<String>,

    /// Show what would be removed without removing it
    #[arg(long)]
    dry_run: bool,

    /// Stop starting new removals after this long
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Docker socket path (defaults to DOCKER_HOST or the platform socket)
    #[arg(long)]
    docker_socket: Option<String>,
  },

  /// Show recorded state
  Status {
    /// Session to show; lists all sessions when omitted
    #[arg(long)]
    session: Option<String>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// List every recorded resource
    #[arg(short, long)]
    verbose: bool,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match run(cli) {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::FAILURE,
    Err(e) => {
      print_error(&format!("{:#}", e));
      ExitCode::FAILURE
    }
  }
}

/// Run the selected command; `Ok(false)` means it ran but some resources failed.
fn run(cli: Cli) -> Result<bool> {
  let format = cli.output;
  match cli.command {
    Commands::Apply {
      file,
      session,
      parallelism,
      timeout,
      docker_socket,
      verbose,
    } => cmd::cmd_apply(
      &ApplyArgs {
        file,
        session,
        parallelism,
        timeout,
        docker_socket,
        verbose,
      },
      format,
    ),
    Commands::Plan {
      file,
      session,
      docker_socket,
      verbose,
    } => {
      cmd::cmd_plan(
        &PlanArgs {
          file,
          session,
          docker_socket,
          verbose,
        },
        format,
      )?;
      Ok(true)
    }
    Commands::Destroy {
      file,
      session,
      dry_run,
      timeout,
      docker_socket,
    } => cmd::cmd_destroy(
      &DestroyArgs {
        file,
        session,
        dry_run,
        timeout,
        docker_socket,
      },
      format,
    ),
    Commands::Status { session, json, verbose } => {
      cmd::cmd_status(session.as_deref(), verbose, json || format.is_json())?;
      Ok(true)
    }
  }
}
