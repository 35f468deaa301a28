mod apply;
mod destroy;
mod plan;
mod status;

pub use apply::{ApplyArgs, cmd_apply};
pub use destroy::{DestroyArgs, cmd_destroy};
pub use plan::{PlanArgs, cmd_plan};
pub use status::cmd_status;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use dockyard_lib::runtime::{DockerRuntime, RuntimeClient};

/// Connect to Docker and check that the daemon answers.
async fn connect(socket: Option<&str>) -> Result<Arc<DockerRuntime>> {
  let runtime = DockerRuntime::connect(socket).context("Failed to connect to Docker")?;
  runtime.ping().await.context("Docker is not reachable")?;
  Ok(Arc::new(runtime))
}

/// Cancel `token` on Ctrl-C. In-flight operations finish; nothing new starts.
fn cancel_on_interrupt(token: CancellationToken) {
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::warn!("interrupted, finishing in-flight operations");
      token.cancel();
    }
  });
}

fn async_runtime() -> Result<tokio::runtime::Runtime> {
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}
