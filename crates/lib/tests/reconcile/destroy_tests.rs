use dockyard_lib::execute::{ReconcileError, SkipReason};
use dockyard_lib::resource::LogicalId;
use dockyard_lib::runtime::{Operation, RuntimeError};
use dockyard_lib::session::{Session, SessionError};

use super::common::{Harness, ids, web_stack};

#[tokio::test]
async fn destroy_removes_everything_dependents_first() {
  let harness = Harness::new();
  harness.apply(|s| web_stack(s, "a")).await;
  harness.runtime.clear_calls();

  let report = harness.session().destroy().await.unwrap();
  assert!(report.is_success());
  assert_eq!(ids(&report.deleted), vec!["c1", "n1"]);
  assert_eq!(harness.calls(Operation::Remove), vec!["c1", "n1"]);
  assert!(harness.runtime.resources().is_empty());
  assert!(harness.records().await.is_empty());
}

#[tokio::test]
async fn destroying_an_empty_session_makes_no_calls() {
  let harness = Harness::new();
  let report = harness.session().destroy().await.unwrap();
  assert_eq!(report.total(), 0);
  assert!(harness.runtime.calls().is_empty());
}

#[tokio::test]
async fn failed_removal_stops_the_sequence() {
  let harness = Harness::new();
  harness.apply(|s| web_stack(s, "a")).await;
  harness
    .runtime
    .fail(Operation::Remove, "c1", RuntimeError::Rejected("device or resource busy".into()));

  let report = harness.session().destroy().await.unwrap();
  assert!(!report.is_success());
  assert_eq!(report.failed[0].logical_id, LogicalId::from("c1"));
  assert_eq!(report.skipped[0].logical_id, LogicalId::from("n1"));
  assert_eq!(report.skipped[0].reason, SkipReason::Aborted);
  assert_eq!(harness.records().await.len(), 2);

  harness.runtime.clear_failures();
  let retry = harness.session().destroy().await.unwrap();
  assert_eq!(ids(&retry.deleted), vec!["c1", "n1"]);
  assert!(harness.records().await.is_empty());
}

#[tokio::test]
async fn resource_already_gone_is_still_forgotten() {
  let harness = Harness::new();
  let first = harness.apply(|s| web_stack(s, "a")).await;
  let (_, c1) = first.outcome(&LogicalId::from("c1")).unwrap();
  harness.runtime.delete_out_of_band(&c1.physical_id);

  let report = harness.session().destroy().await.unwrap();
  assert_eq!(ids(&report.deleted), vec!["c1", "n1"]);
  assert!(harness.records().await.is_empty());
}

#[tokio::test]
async fn read_only_session_cannot_destroy() {
  let harness = Harness::new();
  harness.apply(|s| web_stack(s, "a")).await;

  let session = Session::open_read_only(harness.runtime.clone(), harness.options()).unwrap();
  let err = session.destroy().await.unwrap_err();
  assert!(matches!(err, SessionError::Reconcile(ReconcileError::ReadOnly)));
  assert_eq!(harness.records().await.len(), 2);
}
