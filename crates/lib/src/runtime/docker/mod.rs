//! Docker runtime client built on `bollard`.
//!
//! # Physical identities
//!
//! | Kind      | Physical id                  |
//! |-----------|------------------------------|
//! | image     | image id (`sha256:...`)      |
//! | network   | network id                   |
//! | volume    | volume name                  |
//! | container | container id                 |
//!
//! Every network, volume and container is labelled with the owning session, logical id and
//! configuration hash. A name conflict with a resource carrying our session and logical id is
//! a leftover from an interrupted run: identical leftovers are adopted, stale ones replaced.

mod container;
mod image;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use tracing::{debug, info, warn};

use crate::consts::{LABEL_CONFIG_HASH, LABEL_LOGICAL_ID, LABEL_SESSION};
use crate::resource::ResourceKind;

use super::RuntimeClient;
use super::types::{PhysicalId, PhysicalState, ResourceSpec, RuntimeError};

/// Connection timeout in seconds for explicit sockets.
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Production runtime talking to a Docker daemon.
///
/// Internally uses `Arc<bollard::Docker>` so clones share one connection pool.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
  docker: Arc<Docker>,
}

impl DockerRuntime {
  /// Connect using `DOCKER_HOST` or the platform's default socket.
  ///
  /// The connection is lazy; use [`RuntimeClient::ping`] to check reachability.
  pub fn connect_local() -> Result<Self, RuntimeError> {
    let docker = Docker::connect_with_local_defaults()
      .map_err(|e| RuntimeError::Unavailable(format!("failed to connect to docker: {e}")))?;
    Ok(Self {
      docker: Arc::new(docker),
    })
  }

  /// Connect to a specific socket path (e.g., `/var/run/docker.sock`).
  pub fn connect_with_socket(socket_path: &str) -> Result<Self, RuntimeError> {
    let docker = Docker::connect_with_socket(socket_path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
      .map_err(|e| RuntimeError::Unavailable(format!("failed to connect to docker at {socket_path}: {e}")))?;
    Ok(Self {
      docker: Arc::new(docker),
    })
  }

  /// Connect to `socket_path` when given, the local defaults otherwise.
  pub fn connect(socket_path: Option<&str>) -> Result<Self, RuntimeError> {
    match socket_path {
      Some(path) => Self::connect_with_socket(path),
      None => Self::connect_local(),
    }
  }

  async fn ensure_network(&self, spec: &ResourceSpec) -> Result<PhysicalId, RuntimeError> {
    if let Some(existing) = self.find_network(&spec.name).await? {
      match Ownership::of(&existing.labels, spec) {
        Ownership::Identical => {
          info!(network = %spec.name, "adopting existing network");
          return Ok(existing.physical_id);
        }
        Ownership::Stale => {
          warn!(network = %spec.name, "replacing stale network from an interrupted run");
          self.remove_network(&existing.physical_id).await?;
        }
        Ownership::Foreign => return Err(name_conflict(spec)),
      }
    }

    let options = CreateNetworkOptions {
      name: spec.name.clone(),
      driver: spec.get_str("driver").unwrap_or("bridge").to_string(),
      internal: bool_option(spec, "internal"),
      attachable: bool_option(spec, "attachable"),
      labels: labels(spec),
      ..Default::default()
    };
    self
      .docker
      .create_network(options)
      .await
      .map_err(|e| classify(e, "create network"))?;

    let created = self
      .find_network(&spec.name)
      .await?
      .ok_or_else(|| RuntimeError::Rejected(format!("network '{}' vanished after creation", spec.name)))?;
    debug!(network = %spec.name, id = %created.physical_id, "created network");
    Ok(created.physical_id)
  }

  async fn find_network(&self, name_or_id: &str) -> Result<Option<PhysicalState>, RuntimeError> {
    match self
      .docker
      .inspect_network(name_or_id, None::<InspectNetworkOptions<String>>)
      .await
    {
      Ok(network) => Ok(Some(PhysicalState {
        physical_id: network.id.unwrap_or_default(),
        name: network.name.unwrap_or_default(),
        status: None,
        labels: network.labels.unwrap_or_default().into_iter().collect(),
      })),
      Err(e) if is_not_found(&e) => Ok(None),
      Err(e) => Err(classify(e, "inspect network")),
    }
  }

  async fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
    match self.docker.remove_network(id).await {
      Ok(()) => Ok(()),
      Err(e) if is_not_found(&e) => Ok(()),
      Err(e) => Err(classify(e, "remove network")),
    }
  }

  async fn ensure_volume(&self, spec: &ResourceSpec) -> Result<PhysicalId, RuntimeError> {
    if let Some(existing) = self.find_volume(&spec.name).await? {
      match Ownership::of(&existing.labels, spec) {
        Ownership::Identical => {
          info!(volume = %spec.name, "adopting existing volume");
          return Ok(existing.physical_id);
        }
        Ownership::Stale => {
          warn!(volume = %spec.name, "replacing stale volume from an interrupted run");
          self.remove_volume(&existing.physical_id).await?;
        }
        Ownership::Foreign => return Err(name_conflict(spec)),
      }
    }

    let options = CreateVolumeOptions {
      name: spec.name.clone(),
      driver: spec.get_str("driver").unwrap_or("local").to_string(),
      driver_opts: string_map(spec.get("driver_opts")),
      labels: labels(spec),
      ..Default::default()
    };
    let volume = self
      .docker
      .create_volume(options)
      .await
      .map_err(|e| classify(e, "create volume"))?;
    debug!(volume = %volume.name, "created volume");
    Ok(volume.name)
  }

  async fn find_volume(&self, name: &str) -> Result<Option<PhysicalState>, RuntimeError> {
    match self.docker.inspect_volume(name).await {
      Ok(volume) => Ok(Some(PhysicalState {
        physical_id: volume.name.clone(),
        name: volume.name,
        status: None,
        labels: volume.labels.into_iter().collect(),
      })),
      Err(e) if is_not_found(&e) => Ok(None),
      Err(e) => Err(classify(e, "inspect volume")),
    }
  }

  async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
    match self
      .docker
      .remove_volume(name, Some(RemoveVolumeOptions { force: false }))
      .await
    {
      Ok(()) => Ok(()),
      Err(e) if is_not_found(&e) => Ok(()),
      Err(e) => Err(classify(e, "remove volume")),
    }
  }
}

impl RuntimeClient for DockerRuntime {
  async fn ping(&self) -> Result<(), RuntimeError> {
    self
      .docker
      .ping()
      .await
      .map_err(|e| RuntimeError::Unavailable(format!("ping failed: {e}")))?;
    Ok(())
  }

  async fn ensure(&self, spec: &ResourceSpec) -> Result<PhysicalId, RuntimeError> {
    match spec.kind {
      ResourceKind::Image => self.ensure_image(spec).await,
      ResourceKind::Network => self.ensure_network(spec).await,
      ResourceKind::Volume => self.ensure_volume(spec).await,
      ResourceKind::Container => self.ensure_container(spec).await,
      ResourceKind::Mount => Err(unmanaged()),
    }
  }

  async fn inspect(&self, kind: ResourceKind, physical_id: &str) -> Result<Option<PhysicalState>, RuntimeError> {
    match kind {
      ResourceKind::Image => self.find_image(physical_id).await,
      ResourceKind::Network => self.find_network(physical_id).await,
      ResourceKind::Volume => self.find_volume(physical_id).await,
      ResourceKind::Container => self.find_container(physical_id).await,
      ResourceKind::Mount => Err(unmanaged()),
    }
  }

  async fn update(&self, spec: &ResourceSpec, physical_id: &str) -> Result<PhysicalId, RuntimeError> {
    match spec.kind {
      ResourceKind::Container => self.update_container(spec, physical_id).await,
      kind => Err(RuntimeError::Rejected(format!("{kind} resources cannot be updated in place"))),
    }
  }

  async fn remove(&self, kind: ResourceKind, physical_id: &str) -> Result<(), RuntimeError> {
    match kind {
      ResourceKind::Image => self.remove_image(physical_id).await,
      ResourceKind::Network => self.remove_network(physical_id).await,
      ResourceKind::Volume => self.remove_volume(physical_id).await,
      ResourceKind::Container => self.remove_container(physical_id).await,
      ResourceKind::Mount => Err(unmanaged()),
    }
  }
}

/// How an existing resource with the wanted name relates to the requested `ResourceSpec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
  /// Ours, created from the same configuration.
  Identical,
  /// Ours, from an older configuration.
  Stale,
  Foreign,
}

impl Ownership {
  fn of<L: LabelLookup>(labels: &L, spec: &ResourceSpec) -> Self {
    let ours = labels.label(LABEL_SESSION) == Some(spec.session.as_str())
      && labels.label(LABEL_LOGICAL_ID) == Some(spec.logical_id.as_str());
    if !ours {
      Ownership::Foreign
    } else if labels.label(LABEL_CONFIG_HASH) == Some(spec.config_hash.0.as_str()) {
      Ownership::Identical
    } else {
      Ownership::Stale
    }
  }
}

trait LabelLookup {
  fn label(&self, key: &str) -> Option<&str>;
}

impl LabelLookup for BTreeMap<String, String> {
  fn label(&self, key: &str) -> Option<&str> {
    self.get(key).map(String::as_str)
  }
}

impl LabelLookup for HashMap<String, String> {
  fn label(&self, key: &str) -> Option<&str> {
    self.get(key).map(String::as_str)
  }
}

/// User labels plus ownership labels.
fn labels(spec: &ResourceSpec) -> HashMap<String, String> {
  let mut labels = string_map(spec.get("labels"));
  labels.insert(LABEL_SESSION.to_string(), spec.session.clone());
  labels.insert(LABEL_LOGICAL_ID.to_string(), spec.logical_id.0.clone());
  labels.insert(LABEL_CONFIG_HASH.to_string(), spec.config_hash.0.clone());
  labels
}

fn bool_option(spec: &ResourceSpec, key: &str) -> bool {
  spec.get(key).and_then(serde_json::Value::as_bool).unwrap_or(false)
}

/// Render a scalar option value the way the Docker API expects strings.
fn scalar_string(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::String(s) => s.clone(),
    serde_json::Value::Null => String::new(),
    other => other.to_string(),
  }
}

fn string_map(value: Option<&serde_json::Value>) -> HashMap<String, String> {
  value
    .and_then(serde_json::Value::as_object)
    .map(|map| map.iter().map(|(k, v)| (k.clone(), scalar_string(v))).collect())
    .unwrap_or_default()
}

fn name_conflict(spec: &ResourceSpec) -> RuntimeError {
  RuntimeError::Rejected(format!(
    "{} name '{}' is already used by a resource this session does not own",
    spec.kind, spec.name
  ))
}

fn unmanaged() -> RuntimeError {
  RuntimeError::Rejected("mounts are inlined into containers and have no runtime identity".to_string())
}

fn status_code(err: &BollardError) -> Option<u16> {
  match err {
    BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
    _ => None,
  }
}

fn is_not_found(err: &BollardError) -> bool {
  status_code(err) == Some(404)
}

fn is_conflict(err: &BollardError) -> bool {
  status_code(err) == Some(409)
}

/// Map a bollard error to the runtime taxonomy.
///
/// Responses from the daemon are rejections, except 503; failures to reach the daemon at all
/// are unavailability.
fn classify(err: BollardError, action: &str) -> RuntimeError {
  match err {
    BollardError::DockerResponseServerError { status_code: 503, message } => {
      RuntimeError::Unavailable(format!("{action} failed: {message}"))
    }
    BollardError::DockerResponseServerError { status_code, message } => {
      RuntimeError::Rejected(format!("{action} failed ({status_code}): {message}"))
    }
    BollardError::DockerStreamError { error } => RuntimeError::Rejected(format!("{action} failed: {error}")),
    other => RuntimeError::Unavailable(format!("{action} failed: {other}")),
  }
}
