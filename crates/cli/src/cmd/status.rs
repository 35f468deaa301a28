//! Status command implementation.
//!
//! Shows what is recorded for one session, or lists every session with recorded state.
//! Reads state only; Docker is not contacted.

use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};

use dockyard_lib::platform::paths::state_root;
use dockyard_lib::state::{StateStore, list_sessions};
use dockyard_lib::store_lock::LockMode;

use crate::output::{self, print_info, print_json, print_stat, print_success, print_warning, truncate_id};

pub fn cmd_status(session: Option<&str>, verbose: bool, json: bool) -> Result<()> {
  let root = state_root();

  let Some(session) = session else {
    let sessions = list_sessions(&root).context("Failed to list sessions")?;
    if json {
      return print_json(&serde_json::json!({ "state_root": root, "sessions": sessions }));
    }
    if sessions.is_empty() {
      print_info("No sessions found. Run 'dockyard apply' to create one.");
      return Ok(());
    }
    print_success(&format!("{} session(s) under {}", sessions.len(), root.display()));
    for name in &sessions {
      println!("  {} {}", output::symbols::INFO, name);
    }
    return Ok(());
  };

  let store = match StateStore::open(&root, session, LockMode::Shared, "dockyard status") {
    Ok(store) => store,
    Err(e) if e.is_locked() => {
      print_warning(&format!("Session '{}' is being applied by another process", session));
      return Err(e.into());
    }
    Err(e) => return Err(e).context("Failed to open session state"),
  };
  let records = store.records();

  if json {
    let items: Vec<_> = records.values().collect();
    return print_json(&serde_json::json!({ "session": session, "count": records.len(), "resources": items }));
  }

  if records.is_empty() {
    print_info(&format!("Session '{}' has no recorded resources", session));
    return Ok(());
  }

  print_success(&format!("Session: {}", session));
  print_stat("Resources", &records.len().to_string());
  if let Some(latest) = records.values().map(|r| r.applied_at).max() {
    print_stat("Last applied", &format_millis(latest));
  }

  if verbose {
    println!();
    for record in records.values() {
      println!(
        "  {} {} {} {} {}",
        output::symbols::INFO,
        record.kind,
        record.logical_id,
        record.name,
        truncate_id(&record.physical_id)
      );
    }
  }

  Ok(())
}

fn format_millis(millis: u64) -> String {
  humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_millis(millis)).to_string()
}
