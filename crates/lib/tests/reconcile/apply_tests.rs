use std::time::Duration;

use dockyard_lib::execute::{ReconcileError, ReconcileOptions, SkipReason};
use dockyard_lib::resource::{
  Config, ConfigValue, ConfigurationError, Declarations, Descriptor, LogicalId, ResourceKind, ResourceRef, TemplatePart,
};
use dockyard_lib::runtime::{MemoryRuntime, Operation, RuntimeError};
use dockyard_lib::session::{Session, SessionError};

use super::common::{Harness, ids, physical_id, web_stack};

#[tokio::test]
async fn first_run_creates_dependencies_first() {
  let harness = Harness::new();
  let report = harness.apply(|s| web_stack(s, "a")).await;

  assert!(report.is_success());
  assert_eq!(ids(&report.created), vec!["n1", "c1"]);
  assert_eq!(harness.calls(Operation::Ensure), vec!["n1", "c1"]);

  let c1 = harness.runtime.find("c1").unwrap();
  let n1 = harness.runtime.find("n1").unwrap();
  assert!(c1.uses.contains(&n1.physical_id));
  assert_eq!(c1.status.as_deref(), Some("running"));

  let records = harness.records().await;
  assert_eq!(records.len(), 2);
  assert_eq!(records[&LogicalId::from("c1")].physical_id, c1.physical_id);
  assert_eq!(records[&LogicalId::from("c1")].bindings[&LogicalId::from("n1")], n1.physical_id);
}

#[tokio::test]
async fn second_run_is_a_no_op() {
  let harness = Harness::new();
  let first = harness.apply(|s| web_stack(s, "a")).await;
  harness.runtime.clear_calls();

  let second = harness.apply(|s| web_stack(s, "a")).await;
  assert_eq!(ids(&second.unchanged), vec!["n1", "c1"]);
  assert_eq!(second.changed(), 0);
  assert!(harness.runtime.mutating_calls().is_empty());
  assert_eq!(physical_id(&first, "c1"), physical_id(&second, "c1"));
}

#[tokio::test]
async fn environment_change_recreates_only_the_container() {
  let harness = Harness::new();
  let first = harness.apply(|s| web_stack(s, "a")).await;

  let second = harness.apply(|s| web_stack(s, "b")).await;
  assert_eq!(ids(&second.unchanged), vec!["n1"]);
  assert_eq!(ids(&second.recreated), vec!["c1"]);
  assert_ne!(physical_id(&first, "c1"), physical_id(&second, "c1"));
  assert_eq!(physical_id(&first, "n1"), physical_id(&second, "n1"));

  let c1 = harness.runtime.find("c1").unwrap();
  assert_eq!(c1.config["environment"]["MODE"], "b");
  assert_eq!(harness.runtime.resources().len(), 2);
}

#[tokio::test]
async fn restart_policy_change_is_applied_in_place() {
  let harness = Harness::new();
  let declare = |restart: &'static str| {
    move |s: &mut Session<MemoryRuntime>| {
      s.container("c1", Config::new().with("image", "busybox").with("restart", restart))
        .unwrap();
    }
  };
  let first = harness.apply(declare("no")).await;
  let second = harness.apply(declare("always")).await;

  assert_eq!(ids(&second.updated), vec!["c1"]);
  assert_eq!(physical_id(&first, "c1"), physical_id(&second, "c1"));
  assert_eq!(harness.calls(Operation::Update), vec!["c1"]);
}

#[tokio::test]
async fn replacing_a_network_recreates_attached_containers() {
  let harness = Harness::new();
  let declare = |driver: &'static str| {
    move |s: &mut Session<MemoryRuntime>| {
      let n1 = s.network("n1", Config::new().with("driver", driver)).unwrap();
      s.container(
        "c1",
        Config::new()
          .with("image", "busybox")
          .with("networking", ConfigValue::list([n1.reference()])),
      )
      .unwrap();
    }
  };
  let first = harness.apply(declare("bridge")).await;
  let second = harness.apply(declare("overlay")).await;

  assert!(second.is_success(), "{:?}", second.failed);
  assert_eq!(ids(&second.recreated), vec!["n1", "c1"]);
  assert!(second.deleted.is_empty());

  let n1 = physical_id(&second, "n1");
  assert_ne!(physical_id(&first, "n1"), n1);
  assert!(harness.runtime.find("c1").unwrap().uses.contains(&n1));
  assert_eq!(harness.records().await[&LogicalId::from("c1")].bindings[&LogicalId::from("n1")], n1);
}

#[tokio::test]
async fn new_image_reference_is_created_before_the_old_one_is_removed() {
  let harness = Harness::new();
  let declare = |tag: &'static str| {
    move |s: &mut Session<MemoryRuntime>| {
      let img = s.image("app.img", Config::new().with("ref", tag)).unwrap();
      s.container("app", Config::new().with("image", img.reference())).unwrap();
    }
  };
  harness.apply(declare("app:1")).await;
  harness.runtime.clear_calls();

  let report = harness.apply(declare("app:2")).await;
  assert!(report.is_success(), "{:?}", report.failed);
  assert_eq!(ids(&report.recreated), vec!["app.img", "app"]);

  let mutating: Vec<_> = harness
    .runtime
    .mutating_calls()
    .into_iter()
    .map(|c| (c.op, c.logical_id.map(|id| id.as_str().to_string())))
    .collect();
  assert_eq!(mutating[0], (Operation::Ensure, Some("app.img".to_string())));
  assert_eq!(harness.runtime.find("app.img").unwrap().name, "app:2");
  assert_eq!(harness.runtime.resources().len(), 2);
}

#[tokio::test]
async fn repulling_the_same_image_is_an_update() {
  let harness = Harness::new();
  let declare = |pull: &'static str| {
    move |s: &mut Session<MemoryRuntime>| {
      let img = s.image("app.img", Config::new().with("ref", "app:1").with("pull", pull)).unwrap();
      s.container("app", Config::new().with("image", img.reference())).unwrap();
    }
  };
  let first = harness.apply(declare("missing")).await;
  harness.runtime.clear_calls();

  let second = harness.apply(declare("always")).await;
  assert!(second.is_success(), "{:?}", second.failed);
  assert_eq!(ids(&second.updated), vec!["app.img"]);
  assert!(second.recreated.is_empty());
  assert_eq!(ids(&second.unchanged), vec!["app"]);
  assert_eq!(physical_id(&first, "app.img"), physical_id(&second, "app.img"));
  assert!(harness.calls(Operation::Remove).is_empty());
}

#[tokio::test]
async fn undeclared_resources_are_deleted_dependents_first() {
  let harness = Harness::new();
  harness
    .apply(|s| {
      let n1 = s.network("n1", Config::new()).unwrap();
      let c1 = s
        .container(
          "c1",
          Config::new()
            .with("image", "busybox")
            .with("networking", ConfigValue::list([n1.reference()])),
        )
        .unwrap();
      let c2 = Descriptor::new(ResourceKind::Container, "c2", Config::new().with("image", "busybox"))
        .unwrap()
        .with_dependency(c1.to_ref());
      let mut extra = Declarations::new();
      extra.insert(c2).unwrap();
      s.extend(extra).unwrap();
    })
    .await;
  assert_eq!(harness.calls(Operation::Ensure), vec!["n1", "c1", "c2"]);

  let report = harness.apply(|_| {}).await;
  assert_eq!(ids(&report.deleted), vec!["c2", "c1", "n1"]);
  assert_eq!(harness.calls(Operation::Remove), vec!["c2", "c1", "n1"]);
  assert!(harness.runtime.resources().is_empty());
  assert!(harness.records().await.is_empty());
}

#[tokio::test]
async fn dropping_one_resource_keeps_the_rest() {
  let harness = Harness::new();
  harness.apply(|s| web_stack(s, "a")).await;

  let report = harness
    .apply(|s| {
      s.network("n1", Config::new()).unwrap();
    })
    .await;
  assert_eq!(ids(&report.unchanged), vec!["n1"]);
  assert_eq!(ids(&report.deleted), vec!["c1"]);
  assert_eq!(harness.records().await.len(), 1);
}

#[tokio::test]
async fn cycle_fails_before_any_runtime_call() {
  let harness = Harness::new();
  let mut session = harness.session();
  let a = Descriptor::new(ResourceKind::Container, "a", Config::new().with("image", "x"))
    .unwrap()
    .with_dependency(ResourceRef::new(ResourceKind::Container, "b"));
  let b = Descriptor::new(ResourceKind::Container, "b", Config::new().with("image", "x"))
    .unwrap()
    .with_dependency(ResourceRef::new(ResourceKind::Container, "a"));
  let mut decls = Declarations::new();
  decls.insert(a).unwrap();
  decls.insert(b).unwrap();
  session.extend(decls).unwrap();

  let err = session.finalize().await.unwrap_err();
  assert!(matches!(
    err,
    SessionError::Reconcile(ReconcileError::Configuration(ConfigurationError::CyclicDependency { .. }))
  ));
  assert!(harness.runtime.calls().is_empty());
  assert!(harness.records().await.is_empty());
}

#[tokio::test]
async fn resource_deleted_out_of_band_is_created_again() {
  let harness = Harness::new();
  let first = harness.apply(|s| web_stack(s, "a")).await;
  assert!(harness.runtime.delete_out_of_band(&physical_id(&first, "c1")));

  let second = harness.apply(|s| web_stack(s, "a")).await;
  assert_eq!(ids(&second.created), vec!["c1"]);
  assert_eq!(second.drifted, vec![LogicalId::from("c1")]);
  assert_ne!(physical_id(&first, "c1"), physical_id(&second, "c1"));
  assert_eq!(
    harness.records().await[&LogicalId::from("c1")].physical_id,
    physical_id(&second, "c1")
  );
}

#[tokio::test]
async fn failure_keeps_completed_work_and_the_next_run_resumes() {
  let harness = Harness::new();
  harness
    .runtime
    .fail_once(Operation::Ensure, "c1", RuntimeError::Rejected("port is already allocated".into()));

  let first = harness.apply(|s| web_stack(s, "a")).await;
  assert!(!first.is_success());
  assert_eq!(ids(&first.created), vec!["n1"]);
  assert_eq!(first.failed.len(), 1);
  assert_eq!(first.failed[0].logical_id, LogicalId::from("c1"));
  assert!(first.failed[0].error.contains("port is already allocated"));
  assert!(!first.failed[0].transient);

  let records = harness.records().await;
  assert_eq!(records.keys().map(|id| id.as_str()).collect::<Vec<_>>(), vec!["n1"]);

  harness.runtime.clear_calls();
  let second = harness.apply(|s| web_stack(s, "a")).await;
  assert!(second.is_success());
  assert_eq!(ids(&second.unchanged), vec!["n1"]);
  assert_eq!(ids(&second.created), vec!["c1"]);
  assert_eq!(harness.calls(Operation::Ensure), vec!["c1"]);
}

#[tokio::test]
async fn failed_sibling_does_not_hold_back_its_wave() {
  let harness = Harness::new();
  let declare = |s: &mut Session<MemoryRuntime>| {
    for i in 0..5 {
      s.volume(format!("v{}", i), Config::new()).unwrap();
    }
  };
  harness
    .runtime
    .fail_once(Operation::Ensure, "v2", RuntimeError::Rejected("no space left on device".into()));

  let first = harness.apply(declare).await;
  assert_eq!(first.failed.len(), 1);
  assert_eq!(first.failed[0].logical_id, LogicalId::from("v2"));
  let mut created = ids(&first.created);
  created.sort();
  assert_eq!(created, vec!["v0", "v1", "v3", "v4"]);
  assert_eq!(harness.records().await.len(), 4);

  harness.runtime.clear_calls();
  let second = harness.apply(declare).await;
  assert!(second.is_success(), "{:?}", second.failed);
  assert_eq!(harness.calls(Operation::Ensure), vec!["v2"]);
  assert_eq!(ids(&second.created), vec!["v2"]);
  let mut unchanged = ids(&second.unchanged);
  unchanged.sort();
  assert_eq!(unchanged, vec!["v0", "v1", "v3", "v4"]);
  assert_eq!(harness.records().await.len(), 5);
}

#[tokio::test]
async fn dependent_that_drops_a_replaced_network_is_removed_first() {
  let harness = Harness::new();
  harness.apply(|s| web_stack(s, "a")).await;
  harness.runtime.clear_calls();

  let mut session = harness.session_with(ReconcileOptions {
    parallelism: 1,
    timeout: None,
  });
  session.network("n1", Config::new().with("internal", true)).unwrap();
  session
    .container("c1", Config::new().with("image", "nginx:alpine"))
    .unwrap();
  let report = session.finalize().await.unwrap();

  assert!(report.is_success(), "{:?}", report.failed);
  assert_eq!(ids(&report.recreated), vec!["n1", "c1"]);
  assert_eq!(harness.calls(Operation::Remove), vec!["c1", "n1"]);
  let c1 = harness.runtime.find("c1").unwrap();
  assert!(c1.uses.is_empty());
  assert!(harness.records().await[&LogicalId::from("c1")].bindings.is_empty());
}

#[tokio::test]
async fn dependents_of_a_failed_resource_are_skipped() {
  let harness = Harness::new();
  harness
    .runtime
    .fail(Operation::Ensure, "n1", RuntimeError::Unavailable("connection refused".into()));

  let report = harness.apply(|s| web_stack(s, "a")).await;
  assert_eq!(report.failed[0].logical_id, LogicalId::from("n1"));
  assert!(report.failed[0].transient);
  assert_eq!(report.skipped.len(), 1);
  assert_eq!(report.skipped[0].reason, SkipReason::DependencyFailed("n1".into()));
  assert_eq!(harness.calls(Operation::Ensure), vec!["n1"]);
}

#[tokio::test]
async fn failed_run_does_not_delete_undeclared_resources() {
  let harness = Harness::new();
  harness
    .apply(|s| {
      s.volume("old", Config::new()).unwrap();
    })
    .await;

  harness
    .runtime
    .fail_once(Operation::Ensure, "new", RuntimeError::Rejected("no space left".into()));
  let report = harness
    .apply(|s| {
      s.volume("new", Config::new()).unwrap();
    })
    .await;
  assert_eq!(report.failed.len(), 1);
  assert!(report.deleted.is_empty());
  assert!(harness.records().await.contains_key(&LogicalId::from("old")));
}

#[tokio::test]
async fn parallelism_bounds_concurrent_operations() {
  let harness = Harness::with_runtime(MemoryRuntime::new().with_delay(Duration::from_millis(20)));
  let mut session = harness.session_with(ReconcileOptions {
    parallelism: 3,
    timeout: None,
  });
  for i in 0..10 {
    session.volume(format!("v{}", i), Config::new()).unwrap();
  }

  let report = session.finalize().await.unwrap();
  assert_eq!(report.created.len(), 10);
  assert!(harness.runtime.max_concurrency() <= 3);
  assert!(harness.runtime.max_concurrency() > 1);
}

#[tokio::test]
async fn cancelled_run_starts_nothing() {
  let harness = Harness::new();
  let mut session = harness.session();
  web_stack(&mut session, "a");
  session.cancellation_token().cancel();

  let report = session.finalize().await.unwrap();
  assert!(report.cancelled);
  assert_eq!(report.skipped.len(), 2);
  assert!(report.skipped.iter().all(|s| s.reason == SkipReason::Cancelled));
  assert!(harness.runtime.mutating_calls().is_empty());
}

#[tokio::test]
async fn expired_timeout_cancels_the_run() {
  let harness = Harness::new();
  let mut session = harness.session_with(ReconcileOptions {
    timeout: Some(Duration::ZERO),
    ..ReconcileOptions::default()
  });
  web_stack(&mut session, "a");

  let report = session.finalize().await.unwrap();
  assert!(report.cancelled);
  assert!(report.created.is_empty());
  assert!(harness.records().await.is_empty());
}

#[tokio::test]
async fn mounts_are_inlined_not_created() {
  let harness = Harness::new();
  let report = harness
    .apply(|s| {
      let conf = s
        .mount(
          "conf",
          Config::new()
            .with("source", "/srv/nginx.conf")
            .with("read_only", true),
        )
        .unwrap();
      let data = s.volume("data", Config::new()).unwrap();
      s.container(
        "web",
        Config::new().with("image", "nginx:alpine").with(
          "volumes",
          ConfigValue::map([
            ("/etc/nginx/nginx.conf", conf.reference()),
            ("/data", data.reference()),
          ]),
        ),
      )
      .unwrap();
    })
    .await;

  assert!(report.is_success(), "{:?}", report.failed);
  assert_eq!(ids(&report.created), vec!["data", "web"]);
  assert!(harness.runtime.find("conf").is_none());

  let web = harness.runtime.find("web").unwrap();
  assert_eq!(web.config["volumes"]["/etc/nginx/nginx.conf"]["source"], "/srv/nginx.conf");
  assert_eq!(web.config["volumes"]["/etc/nginx/nginx.conf"]["type"], "bind");
}

#[tokio::test]
async fn templates_render_dependency_names() {
  let harness = Harness::new();
  harness
    .apply(|s| {
      let db = s
        .container("db", Config::new().with("image", "postgres:16").with("name", "pg-main"))
        .unwrap();
      s.container(
        "app",
        Config::new().with("image", "app:1").with(
          "environment",
          ConfigValue::map([(
            "DATABASE_HOST",
            ConfigValue::Template(vec![
              TemplatePart::Text("tcp://".into()),
              db.name(),
              TemplatePart::Text(":5432".into()),
            ]),
          )]),
        ),
      )
      .unwrap();
    })
    .await;

  assert_eq!(harness.calls(Operation::Ensure), vec!["db", "app"]);
  let app = harness.runtime.find("app").unwrap();
  assert_eq!(app.config["environment"]["DATABASE_HOST"], "tcp://pg-main:5432");
  assert!(app.uses.is_empty());
}
