use dockyard_lib::execute::{Action, Plan};
use dockyard_lib::resource::{Config, ConfigValue, LogicalId};
use dockyard_lib::runtime::MemoryRuntime;
use dockyard_lib::session::Session;

use super::common::{Harness, physical_id, web_stack};

fn actions(plan: &Plan) -> Vec<(&str, Action)> {
  plan.changes.iter().map(|c| (c.logical_id.as_str(), c.action)).collect()
}

fn planning_session(harness: &Harness) -> Session<MemoryRuntime> {
  Session::open_read_only(harness.runtime.clone(), harness.options()).unwrap()
}

#[tokio::test]
async fn fresh_session_plans_creates_in_dependency_order() {
  let harness = Harness::new();
  let mut session = planning_session(&harness);
  web_stack(&mut session, "a");

  let plan = session.plan().await.unwrap();
  assert_eq!(actions(&plan), vec![("n1", Action::Create), ("c1", Action::Create)]);
  assert!(plan.changes.iter().all(|c| c.physical_id.is_none()));
  assert!(harness.runtime.calls().is_empty());
}

#[tokio::test]
async fn environment_change_plans_a_recreate_without_mutating() {
  let harness = Harness::new();
  let first = harness.apply(|s| web_stack(s, "a")).await;
  harness.runtime.clear_calls();

  let mut session = planning_session(&harness);
  web_stack(&mut session, "b");
  let plan = session.plan().await.unwrap();

  assert_eq!(actions(&plan), vec![("n1", Action::Unchanged), ("c1", Action::Recreate)]);
  let c1 = plan.get(&LogicalId::from("c1")).unwrap();
  assert!(c1.reason.as_deref().unwrap().contains("environment"), "{:?}", c1.reason);
  assert_eq!(c1.physical_id.as_deref(), Some(physical_id(&first, "c1").as_str()));
  assert!(plan.has_changes());
  assert!(harness.runtime.mutating_calls().is_empty());
}

#[tokio::test]
async fn unchanged_declarations_plan_no_changes() {
  let harness = Harness::new();
  harness.apply(|s| web_stack(s, "a")).await;

  let mut session = planning_session(&harness);
  web_stack(&mut session, "a");
  let plan = session.plan().await.unwrap();
  assert!(!plan.has_changes());
  assert_eq!(plan.count(Action::Unchanged), 2);
}

#[tokio::test]
async fn undeclared_records_plan_deletes() {
  let harness = Harness::new();
  harness.apply(|s| web_stack(s, "a")).await;

  let mut session = planning_session(&harness);
  session.network("n1", Config::new()).unwrap();
  let plan = session.plan().await.unwrap();

  assert_eq!(actions(&plan), vec![("n1", Action::Unchanged), ("c1", Action::Delete)]);
  let c1 = plan.get(&LogicalId::from("c1")).unwrap();
  assert_eq!(c1.reason.as_deref(), Some("no longer declared"));
}

#[tokio::test]
async fn resource_missing_from_runtime_plans_a_create() {
  let harness = Harness::new();
  let first = harness.apply(|s| web_stack(s, "a")).await;
  harness.runtime.delete_out_of_band(&physical_id(&first, "c1"));

  let mut session = planning_session(&harness);
  web_stack(&mut session, "a");
  let plan = session.plan().await.unwrap();

  let c1 = plan.get(&LogicalId::from("c1")).unwrap();
  assert_eq!(c1.action, Action::Create);
  assert_eq!(c1.reason.as_deref(), Some("missing from runtime"));
}

#[tokio::test]
async fn replaced_dependency_propagates_to_dependents() {
  let declare = |s: &mut Session<MemoryRuntime>, driver: &str| {
    let n1 = s.network("n1", Config::new().with("driver", driver)).unwrap();
    s.container(
      "c1",
      Config::new()
        .with("image", "nginx:alpine")
        .with("networking", ConfigValue::list([n1.reference()])),
    )
    .unwrap();
  };
  let harness = Harness::new();
  harness.apply(|s| declare(s, "bridge")).await;

  let mut session = planning_session(&harness);
  declare(&mut session, "overlay");
  let plan = session.plan().await.unwrap();

  assert_eq!(actions(&plan), vec![("n1", Action::Recreate), ("c1", Action::Recreate)]);
  let c1 = plan.get(&LogicalId::from("c1")).unwrap();
  assert_eq!(c1.reason.as_deref(), Some("dependency 'n1' replaced"));
}

#[tokio::test]
async fn destroy_plan_lists_dependents_first() {
  let harness = Harness::new();
  harness.apply(|s| web_stack(s, "a")).await;
  harness.runtime.clear_calls();

  let plan = planning_session(&harness).plan_destroy().await.unwrap();
  assert_eq!(actions(&plan), vec![("c1", Action::Delete), ("n1", Action::Delete)]);
  assert!(harness.runtime.calls().is_empty());
  assert_eq!(harness.records().await.len(), 2);
}

#[tokio::test]
async fn plan_is_allowed_while_another_plan_holds_the_session() {
  let harness = Harness::new();
  let _holder = planning_session(&harness);
  let mut session = planning_session(&harness);
  web_stack(&mut session, "a");
  assert_eq!(session.plan().await.unwrap().count(Action::Create), 2);
}
