//! CLI output formatting utilities.
//!
//! Colored status lines, plan and report rendering, and JSON output.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use dockyard_lib::execute::{Action, Outcome, Plan, ReconciliationReport};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ADD: &str = "+";
  pub const MODIFY: &str = "~";
  pub const REPLACE: &str = "±";
  pub const REMOVE: &str = "-";
  pub const SKIP: &str = "○";
}

/// Docker's short id form.
pub fn truncate_id(id: &str) -> &str {
  let id = id.strip_prefix("sha256:").unwrap_or(id);
  let len = id.len().min(12);
  &id[..len]
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    let mins = secs / 60;
    let remaining_secs = secs % 60;
    format!("{}m {}s", mins, remaining_secs)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

fn action_symbol(action: Action) -> String {
  match action {
    Action::Create => symbols::ADD.if_supports_color(Stream::Stdout, |s| s.green()).to_string(),
    Action::Update => symbols::MODIFY.if_supports_color(Stream::Stdout, |s| s.yellow()).to_string(),
    Action::Recreate => symbols::REPLACE.if_supports_color(Stream::Stdout, |s| s.yellow()).to_string(),
    Action::Delete => symbols::REMOVE.if_supports_color(Stream::Stdout, |s| s.red()).to_string(),
    Action::Unchanged => " ".to_string(),
  }
}

fn outcome_symbol(outcome: Outcome) -> String {
  match outcome {
    Outcome::Created => action_symbol(Action::Create),
    Outcome::Updated => action_symbol(Action::Update),
    Outcome::Recreated => action_symbol(Action::Recreate),
    Outcome::Deleted => action_symbol(Action::Delete),
    Outcome::Unchanged => action_symbol(Action::Unchanged),
  }
}

/// Render a plan. Unchanged resources are listed only when `verbose`.
pub fn print_plan(plan: &Plan, verbose: bool) {
  for change in &plan.changes {
    if change.action == Action::Unchanged && !verbose {
      continue;
    }
    let mut line = format!(
      "  {} {} {}",
      action_symbol(change.action),
      change.kind,
      change.logical_id
    );
    if let Some(reason) = &change.reason {
      line.push_str(&format!(
        " {}",
        format!("({})", reason).if_supports_color(Stream::Stdout, |s| s.dimmed())
      ));
    }
    println!("{}", line);
  }

  println!();
  print_stat(
    "Plan",
    &format!(
      "{} to create, {} to update, {} to recreate, {} to delete, {} unchanged",
      plan.count(Action::Create),
      plan.count(Action::Update),
      plan.count(Action::Recreate),
      plan.count(Action::Delete),
      plan.count(Action::Unchanged)
    ),
  );
}

/// Render a run report: one line per resource, then failures and totals.
pub fn print_report(report: &ReconciliationReport, verbose: bool) {
  for (outcome, entry) in report.entries() {
    if outcome == Outcome::Unchanged && !verbose {
      continue;
    }
    println!(
      "  {} {} {} {} {}",
      outcome_symbol(outcome),
      entry.kind,
      entry.logical_id,
      outcome.if_supports_color(Stream::Stdout, |s| s.dimmed()),
      truncate_id(&entry.physical_id).if_supports_color(Stream::Stdout, |s| s.dimmed())
    );
  }

  for id in &report.drifted {
    print_warning(&format!("{} was missing from the runtime and has been recreated", id));
  }

  for failed in &report.failed {
    print_error(&format!("{} {}: {}", failed.kind, failed.logical_id, failed.error));
  }

  for skipped in &report.skipped {
    eprintln!(
      "  {} {} {} {}",
      symbols::SKIP.if_supports_color(Stream::Stderr, |s| s.dimmed()),
      skipped.kind,
      skipped.logical_id,
      format!("(skipped: {})", skipped.reason).if_supports_color(Stream::Stderr, |s| s.dimmed())
    );
  }

  println!();
  print_stat("Created", &report.created.len().to_string());
  print_stat("Updated", &report.updated.len().to_string());
  print_stat("Recreated", &report.recreated.len().to_string());
  print_stat("Deleted", &report.deleted.len().to_string());
  print_stat("Unchanged", &report.unchanged.len().to_string());
  if !report.failed.is_empty() {
    print_stat("Failed", &report.failed.len().to_string());
  }
  if !report.skipped.is_empty() {
    print_stat("Skipped", &report.skipped.len().to_string());
  }
  if report.cancelled {
    print_warning("Run was cancelled before all resources were processed");
  }
}
