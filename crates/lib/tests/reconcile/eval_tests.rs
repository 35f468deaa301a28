use std::path::PathBuf;

use tempfile::TempDir;

use dockyard_lib::eval::evaluate_config;
use dockyard_lib::resource::LogicalId;

use super::common::{Harness, ids};

fn write_stack(dir: &TempDir, content: &str) -> PathBuf {
  let file = dir.path().join("stack.lua");
  std::fs::write(&file, content).unwrap();
  file
}

const STACK: &str = r#"
local util = require("util")

return {
  session = "web-stack",
  setup = function(ctx)
    local private = ctx.network("private", { internal = true })
    local data = ctx.volume("pgdata")
    local db = ctx.container("database", {
      image = "postgres:16-alpine",
      environment = { POSTGRES_DB = "appdb" },
      volumes = { ["/var/lib/postgresql/data"] = data },
      networking = { [private] = { aliases = { "db" } } },
    })
    ctx.container("app", {
      image = "app:latest",
      environment = { DATABASE_URL = util.pg_url(ctx, db) },
      volumes = { ["/etc/app"] = ctx.bind_mount("app.conf", "conf", { read_only = true }) },
      networking = { private },
      depends_on = { db },
    })
  end,
}
"#;

const UTIL: &str = r#"
local M = {}

function M.pg_url(ctx, db)
  return ctx.format("postgres://", db, ":5432/appdb")
end

return M
"#;

#[tokio::test]
async fn evaluated_file_reconciles_end_to_end() {
  let project = TempDir::new().unwrap();
  std::fs::create_dir(project.path().join("lua")).unwrap();
  std::fs::write(project.path().join("lua").join("util.lua"), UTIL).unwrap();
  let file = write_stack(&project, STACK);

  let evaluated = evaluate_config(&file, None).unwrap();
  assert_eq!(evaluated.session, "web-stack");
  let conf_source = evaluated.dir.join("conf").to_string_lossy().to_string();

  let harness = Harness::new();
  let report = harness
    .apply(|s| s.extend(evaluated.declarations).unwrap())
    .await;
  assert!(report.is_success(), "{:?}", report.failed);

  let mut created = ids(&report.created);
  created.sort();
  assert_eq!(created, vec!["app", "database", "pgdata", "private"]);
  assert!(report.outcome(&LogicalId::from("app.conf")).is_none());

  let app = harness.runtime.find("app").unwrap();
  let database = harness.runtime.find("database").unwrap();
  assert_eq!(app.config["environment"]["DATABASE_URL"], format!("postgres://{}:5432/appdb", database.name));
  let conf = &app.config["volumes"]["/etc/app"];
  assert_eq!(conf["source"], conf_source);
  assert_eq!(conf["read_only"], true);
}

#[tokio::test]
async fn re_evaluating_an_unchanged_file_is_a_no_op() {
  let project = TempDir::new().unwrap();
  let file = write_stack(
    &project,
    r#"
    return {
      setup = function(ctx)
        local net = ctx.network("n1")
        ctx.container("c1", { image = "busybox", networking = { net } })
      end,
    }
    "#,
  );

  let harness = Harness::new();
  let first = evaluate_config(&file, None).unwrap();
  harness.apply(|s| s.extend(first.declarations).unwrap()).await;
  harness.runtime.clear_calls();

  let second = evaluate_config(&file, None).unwrap();
  let report = harness.apply(|s| s.extend(second.declarations).unwrap()).await;
  assert_eq!(ids(&report.unchanged), vec!["n1", "c1"]);
  assert!(harness.runtime.mutating_calls().is_empty());
}
