//! Dry runs: the same diff as a reconciliation, computed with `inspect` calls only.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::debug;

use crate::resource::{Declarations, LogicalId};
use crate::runtime::{Binding, RuntimeClient, UpdatePolicy};
use crate::state::StateRecord;

use super::dag::ResourceDag;
use super::resolve::{self, Desired};
use super::types::{Action, Plan, PlannedChange, ReconcileError};
use super::{Reconciler, runtime_error};

impl<R: RuntimeClient> Reconciler<R> {
  /// Compute what [`Reconciler::reconcile`] would do, without mutating anything.
  ///
  /// Works on a read-only store handle.
  pub async fn plan(&self, declarations: &Declarations) -> Result<Plan, ReconcileError> {
    let dag = ResourceDag::from_declarations(declarations)?;
    let desired = resolve::resolve_all(declarations, &dag)?;
    let records = self.records().await;

    let mut plan = Plan {
      session: self.session.clone(),
      changes: Vec::new(),
    };
    // Resources that will end up with a different physical id.
    let mut replaced: BTreeSet<LogicalId> = BTreeSet::new();

    for id in dag.topological_order() {
      let Some(item) = desired.get(id) else {
        continue;
      };
      if !item.kind().is_managed() {
        continue;
      }

      let record = records.get(id);
      let (action, reason) = match record {
        None => (Action::Create, None),
        Some(record) if record.kind != item.kind() => {
          (Action::Recreate, Some(format!("kind changed from {}", record.kind)))
        }
        Some(record) => {
          let stale = item.bindings.iter().find(|dep| {
            replaced.contains(*dep) || record.bindings.get(*dep) != records.get(*dep).map(|r| &r.physical_id)
          });

          if let Some(dep) = stale {
            (Action::Recreate, Some(format!("dependency '{}' replaced", dep)))
          } else if record.config_hash == item.config_hash {
            let found = self
              .runtime
              .inspect(record.kind, &record.physical_id)
              .await
              .map_err(runtime_error(record.kind, id))?;
            match found {
              Some(_) => (Action::Unchanged, None),
              None => (Action::Create, Some("missing from runtime".to_string())),
            }
          } else {
            let spec = item.spec(&self.session, &planned_bindings(item, &records));
            let changed = changed_options(&item.config, &record.config);
            let reason = Some(format!("changed: {}", changed.join(", ")));
            match self.runtime.update_policy(&spec, &record.config) {
              UpdatePolicy::InPlace => (Action::Update, reason),
              UpdatePolicy::Recreate => (Action::Recreate, reason),
            }
          }
        }
      };

      if matches!(action, Action::Create | Action::Recreate) {
        replaced.insert(id.clone());
      }
      debug!(resource = %id, action = %action, "planned");
      plan.changes.push(PlannedChange {
        logical_id: id.clone(),
        kind: item.kind(),
        action,
        physical_id: record.map(|r| r.physical_id.clone()),
        reason,
      });
    }

    let orphans: BTreeMap<_, _> = records
      .iter()
      .filter(|(id, _)| !declarations.contains(id))
      .map(|(id, record)| (id.clone(), record.clone()))
      .collect();
    for id in ResourceDag::from_records(&orphans)?.deletion_order() {
      let record = &orphans[&id];
      plan.changes.push(PlannedChange {
        logical_id: id,
        kind: record.kind,
        action: Action::Delete,
        physical_id: Some(record.physical_id.clone()),
        reason: Some("no longer declared".to_string()),
      });
    }

    Ok(plan)
  }

  /// Every recorded resource, in the order [`Reconciler::destroy`] would remove them.
  pub async fn plan_destroy(&self) -> Result<Plan, ReconcileError> {
    let records = self.records().await;
    let changes = ResourceDag::from_records(&records)?
      .deletion_order()
      .into_iter()
      .filter_map(|id| {
        records.get(&id).map(|record| PlannedChange {
          logical_id: id.clone(),
          kind: record.kind,
          action: Action::Delete,
          physical_id: Some(record.physical_id.clone()),
          reason: None,
        })
      })
      .collect();

    Ok(Plan {
      session: self.session.clone(),
      changes,
    })
  }
}

/// Bindings as they are recorded now, for update-policy decisions.
fn planned_bindings(item: &Desired, records: &BTreeMap<LogicalId, StateRecord>) -> BTreeMap<LogicalId, Binding> {
  item
    .bindings
    .iter()
    .filter_map(|dep| {
      records.get(dep).map(|r| {
        (
          dep.clone(),
          Binding {
            kind: r.kind,
            name: r.name.clone(),
            physical_id: r.physical_id.clone(),
          },
        )
      })
    })
    .collect()
}

/// Option names whose canonical value differs, sorted.
fn changed_options(next: &BTreeMap<String, Value>, previous: &BTreeMap<String, Value>) -> Vec<String> {
  let keys: BTreeSet<&String> = next.keys().chain(previous.keys()).collect();
  keys
    .into_iter()
    .filter(|key| next.get(*key) != previous.get(*key))
    .cloned()
    .collect()
}
