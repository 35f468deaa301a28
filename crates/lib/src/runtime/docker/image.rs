//! Image pulls and builds.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use bollard::image::{BuildImageOptions, CreateImageOptions, RemoveImageOptions};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use super::{DockerRuntime, classify, is_conflict, is_not_found, scalar_string};
use crate::runtime::types::{PhysicalId, PhysicalState, ResourceSpec, RuntimeError};

const DEFAULT_DOCKERFILE: &str = "Dockerfile";

impl DockerRuntime {
  pub(super) async fn ensure_image(&self, spec: &ResourceSpec) -> Result<PhysicalId, RuntimeError> {
    let reference = spec.name.as_str();

    if let Some(build) = spec.get("build") {
      self.build_image(reference, build).await?;
    } else {
      match spec.get_str("pull").unwrap_or("missing") {
        "always" => self.pull_image(reference).await?,
        "never" => {}
        _ => {
          if self.find_image(reference).await?.is_none() {
            self.pull_image(reference).await?;
          }
        }
      }
    }

    let image = self
      .find_image(reference)
      .await?
      .ok_or_else(|| RuntimeError::Rejected(format!("image '{reference}' is not available locally")))?;
    debug!(image = %reference, id = %image.physical_id, "image ready");
    Ok(image.physical_id)
  }

  /// Make sure an unmanaged image reference is present, pulling it if missing.
  pub(super) async fn ensure_image_present(&self, reference: &str) -> Result<(), RuntimeError> {
    if self.find_image(reference).await?.is_none() {
      self.pull_image(reference).await?;
    }
    Ok(())
  }

  pub(super) async fn find_image(&self, name_or_id: &str) -> Result<Option<PhysicalState>, RuntimeError> {
    match self.docker.inspect_image(name_or_id).await {
      Ok(image) => Ok(Some(PhysicalState {
        physical_id: image.id.unwrap_or_default(),
        name: image
          .repo_tags
          .and_then(|tags| tags.into_iter().next())
          .unwrap_or_else(|| name_or_id.to_string()),
        status: None,
        labels: Default::default(),
      })),
      Err(e) if is_not_found(&e) => Ok(None),
      Err(e) => Err(classify(e, "inspect image")),
    }
  }

  /// Remove an image. An image still used by containers outside this session stays in the
  /// local cache.
  pub(super) async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
    let options = RemoveImageOptions {
      force: false,
      noprune: false,
    };
    match self.docker.remove_image(id, Some(options), None).await {
      Ok(_) => Ok(()),
      Err(e) if is_not_found(&e) => Ok(()),
      Err(e) if is_conflict(&e) => {
        warn!(image = %id, "image is still in use, leaving it in the local cache");
        Ok(())
      }
      Err(e) => Err(classify(e, "remove image")),
    }
  }

  async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
    info!(image = %reference, "pulling image");
    let options = CreateImageOptions {
      from_image: reference.to_string(),
      ..Default::default()
    };

    let mut stream = self.docker.create_image(Some(options), None, None);
    while let Some(progress) = stream.next().await {
      let progress = progress.map_err(|e| classify(e, "pull image"))?;
      if let Some(status) = progress.status {
        trace!(image = %reference, "{}", status);
      }
    }
    Ok(())
  }

  async fn build_image(&self, reference: &str, build: &Value) -> Result<(), RuntimeError> {
    let context = build
      .get("context")
      .and_then(Value::as_str)
      .map(PathBuf::from)
      .ok_or_else(|| RuntimeError::Rejected(format!("image '{reference}' has no build context")))?;
    let dockerfile = build
      .get("dockerfile")
      .and_then(Value::as_str)
      .unwrap_or(DEFAULT_DOCKERFILE)
      .to_string();
    let buildargs: HashMap<String, String> = build
      .get("args")
      .and_then(Value::as_object)
      .map(|args| args.iter().map(|(k, v)| (k.clone(), scalar_string(v))).collect())
      .unwrap_or_default();

    info!(image = %reference, context = %context.display(), "building image");

    let archive = tokio::task::spawn_blocking(move || archive_context(&context))
      .await
      .map_err(|e| RuntimeError::Rejected(format!("build context task failed: {e}")))?
      .map_err(|e| RuntimeError::Rejected(format!("failed to archive build context: {e}")))?;

    let options = BuildImageOptions {
      dockerfile,
      t: reference.to_string(),
      buildargs,
      rm: true,
      ..Default::default()
    };

    let mut stream = self.docker.build_image(options, None, Some(Bytes::from(archive)));
    while let Some(step) = stream.next().await {
      let step = step.map_err(|e| classify(e, "build image"))?;
      if let Some(error) = step.error {
        return Err(RuntimeError::Rejected(format!("build of '{reference}' failed: {error}")));
      }
      if let Some(line) = step.stream {
        let line = line.trim_end();
        if !line.is_empty() {
          trace!(image = %reference, "{}", line);
        }
      }
    }
    Ok(())
  }
}

/// Tar the build context directory for the Docker build API.
fn archive_context(dir: &Path) -> io::Result<Vec<u8>> {
  let mut builder = tar::Builder::new(Vec::new());
  builder.follow_symlinks(false);
  builder.append_dir_all(".", dir)?;
  builder.into_inner()
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn archive_contains_context_files() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("Dockerfile"), "FROM scratch\n").unwrap();
    std::fs::create_dir(temp.path().join("src")).unwrap();
    std::fs::write(temp.path().join("src/main.txt"), "hello").unwrap();

    let bytes = archive_context(temp.path()).unwrap();
    let mut archive = tar::Archive::new(bytes.as_slice());
    let names: Vec<String> = archive
      .entries()
      .unwrap()
      .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
      .collect();

    assert!(names.iter().any(|n| n.ends_with("Dockerfile")));
    assert!(names.iter().any(|n| n.ends_with("src/main.txt")));
  }

  #[test]
  fn archive_of_missing_directory_fails() {
    let temp = TempDir::new().unwrap();
    assert!(archive_context(&temp.path().join("missing")).is_err());
  }
}
