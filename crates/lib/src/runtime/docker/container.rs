//! Container creation, in-place updates and removal.

use std::collections::{BTreeSet, HashMap};

use bollard::container::{
  Config, CreateContainerOptions, InspectContainerOptions, NetworkingConfig, RemoveContainerOptions,
  StartContainerOptions, StopContainerOptions, UpdateContainerOptions,
};
use bollard::models::{
  EndpointSettings, HealthConfig, HostConfig, Mount, MountTypeEnum, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::ConnectNetworkOptions;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{DockerRuntime, Ownership, classify, is_not_found, labels, scalar_string};
use crate::resource::ResourceKind;
use crate::resource::options::duration_nanos;
use crate::runtime::types::{PhysicalId, PhysicalState, ResourceSpec, RuntimeError, decode_ref};

/// Grace period before a stopped container is killed.
const STOP_TIMEOUT_SECS: i64 = 10;

impl DockerRuntime {
  pub(super) async fn ensure_container(&self, spec: &ResourceSpec) -> Result<PhysicalId, RuntimeError> {
    if let Some((existing, attached)) = self.inspect_attached(&spec.name).await? {
      match adoption(Ownership::of(&existing.labels, spec), spec, &attached)? {
        Ownership::Identical => {
          info!(container = %spec.name, "adopting existing container");
          self.apply_status(spec, &existing).await?;
          return Ok(existing.physical_id);
        }
        Ownership::Stale => {
          warn!(container = %spec.name, "replacing stale container from an interrupted run");
          self.remove_container(&existing.physical_id).await?;
        }
        Ownership::Foreign => return Err(super::name_conflict(spec)),
      }
    }

    let image = match spec.get("image") {
      Some(Value::String(reference)) => {
        self.ensure_image_present(reference).await?;
        reference.clone()
      }
      Some(value) => spec.resolve(value)?.physical_id.clone(),
      None => return Err(RuntimeError::Rejected(format!("container '{}' has no image", spec.name))),
    };

    let (config, extra_networks) = create_config(spec, image)?;
    let options = CreateContainerOptions {
      name: spec.name.clone(),
      platform: None,
    };
    let created = self
      .docker
      .create_container(Some(options), config)
      .await
      .map_err(|e| classify(e, "create container"))?;
    for warning in &created.warnings {
      warn!(container = %spec.name, "{}", warning);
    }

    if let Err(e) = self.finish_create(spec, &created.id, extra_networks).await {
      // No unrecorded, partially configured container may outlive a failed create.
      if let Err(cleanup) = self.remove_container(&created.id).await {
        warn!(
          container = %spec.name,
          id = %created.id,
          error = %cleanup,
          "failed to remove partially created container"
        );
      }
      return Err(e);
    }

    debug!(container = %spec.name, id = %created.id, "created container");
    Ok(created.id)
  }

  /// Connect the networks Docker could not attach at creation, then start the container.
  async fn finish_create(
    &self,
    spec: &ResourceSpec,
    id: &str,
    extra_networks: Vec<(String, EndpointSettings)>,
  ) -> Result<(), RuntimeError> {
    for (network, endpoint) in extra_networks {
      let connect = ConnectNetworkOptions {
        container: id.to_string(),
        endpoint_config: endpoint,
      };
      self
        .docker
        .connect_network(&network, connect)
        .await
        .map_err(|e| classify(e, "connect network"))?;
    }

    if desired_status(spec) == "running" {
      self.start_container(id).await?;
    }
    Ok(())
  }

  pub(super) async fn find_container(&self, name_or_id: &str) -> Result<Option<PhysicalState>, RuntimeError> {
    Ok(self.inspect_attached(name_or_id).await?.map(|(state, _)| state))
  }

  /// Inspect a container along with the names and ids of the networks it is attached to.
  async fn inspect_attached(
    &self,
    name_or_id: &str,
  ) -> Result<Option<(PhysicalState, BTreeSet<String>)>, RuntimeError> {
    let container = match self
      .docker
      .inspect_container(name_or_id, None::<InspectContainerOptions>)
      .await
    {
      Ok(container) => container,
      Err(e) if is_not_found(&e) => return Ok(None),
      Err(e) => return Err(classify(e, "inspect container")),
    };

    let mut attached = BTreeSet::new();
    for (network, endpoint) in container
      .network_settings
      .and_then(|settings| settings.networks)
      .unwrap_or_default()
    {
      attached.extend(endpoint.network_id);
      attached.insert(network);
    }

    let state = PhysicalState {
      physical_id: container.id.unwrap_or_default(),
      name: container
        .name
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default(),
      status: container
        .state
        .and_then(|s| s.status)
        .map(|s| format!("{s:?}").to_lowercase()),
      labels: container
        .config
        .and_then(|c| c.labels)
        .unwrap_or_default()
        .into_iter()
        .collect(),
    };
    Ok(Some((state, attached)))
  }

  pub(super) async fn update_container(&self, spec: &ResourceSpec, id: &str) -> Result<PhysicalId, RuntimeError> {
    let options = UpdateContainerOptions::<String> {
      restart_policy: Some(restart_policy(spec)),
      ..Default::default()
    };
    self
      .docker
      .update_container(id, options)
      .await
      .map_err(|e| classify(e, "update container"))?;

    let current = self
      .find_container(id)
      .await?
      .ok_or_else(|| RuntimeError::Rejected(format!("container {id} disappeared during update")))?;
    self.apply_status(spec, &current).await?;

    debug!(container = %spec.name, id, "updated container in place");
    Ok(id.to_string())
  }

  pub(super) async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
    let options = RemoveContainerOptions {
      force: true,
      ..Default::default()
    };
    match self.docker.remove_container(id, Some(options)).await {
      Ok(()) => Ok(()),
      Err(e) if is_not_found(&e) => Ok(()),
      Err(e) => Err(classify(e, "remove container")),
    }
  }

  /// Start or stop a container to match the `status` option.
  async fn apply_status(&self, spec: &ResourceSpec, current: &PhysicalState) -> Result<(), RuntimeError> {
    let running = current.status.as_deref() == Some("running");
    match (desired_status(spec), running) {
      ("running", false) => self.start_container(&current.physical_id).await,
      ("stopped", true) => {
        self
          .docker
          .stop_container(&current.physical_id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
          .await
          .map_err(|e| classify(e, "stop container"))
      }
      _ => Ok(()),
    }
  }

  async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
    self
      .docker
      .start_container(id, None::<StartContainerOptions<String>>)
      .await
      .map_err(|e| classify(e, "start container"))
  }
}

fn desired_status(spec: &ResourceSpec) -> &str {
  spec.get_str("status").unwrap_or("running")
}

/// Translate canonical container configuration into a create request.
///
/// Docker attaches at most one network at creation time; the remaining networks are returned
/// to be connected before the container starts.
fn create_config(
  spec: &ResourceSpec,
  image: String,
) -> Result<(Config<String>, Vec<(String, EndpointSettings)>), RuntimeError> {
  let mut host_config = HostConfig {
    restart_policy: Some(restart_policy(spec)),
    ..Default::default()
  };

  let mut exposed_ports = HashMap::new();
  if let Some(ports) = spec.get("ports").and_then(Value::as_object) {
    let mut bindings = HashMap::new();
    for (container_port, host) in ports {
      let key = if container_port.contains('/') {
        container_port.clone()
      } else {
        format!("{container_port}/tcp")
      };
      let host = scalar_string(host);
      let (host_ip, host_port) = match host.rsplit_once(':') {
        Some((ip, port)) => (Some(ip.to_string()), port.to_string()),
        None => (None, host),
      };
      exposed_ports.insert(key.clone(), HashMap::new());
      bindings.insert(
        key,
        Some(vec![PortBinding {
          host_ip,
          host_port: Some(host_port),
        }]),
      );
    }
    host_config.port_bindings = Some(bindings);
  }

  if let Some(volumes) = spec.get("volumes").and_then(Value::as_object) {
    let mut mounts = Vec::with_capacity(volumes.len());
    for (target, source) in volumes {
      mounts.push(mount(spec, target, source)?);
    }
    host_config.mounts = Some(mounts);
  }

  let mut endpoints = network_endpoints(spec)?;
  let extra_networks = if endpoints.len() > 1 {
    endpoints.split_off(1)
  } else {
    Vec::new()
  };
  if let Some((primary, _)) = endpoints.first() {
    host_config.network_mode = Some(primary.clone());
  }

  let config = Config {
    image: Some(image),
    cmd: spec.get("command").map(command_list),
    entrypoint: spec.get("entrypoint").map(command_list),
    env: spec.get("environment").and_then(Value::as_object).map(|env| {
      env
        .iter()
        .map(|(k, v)| format!("{}={}", k, scalar_string(v)))
        .collect()
    }),
    labels: Some(labels(spec)),
    exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
    healthcheck: spec.get("healthcheck").map(healthcheck),
    working_dir: spec.get_str("working_dir").map(str::to_string),
    user: spec.get_str("user").map(str::to_string),
    hostname: spec.get_str("hostname").map(str::to_string),
    host_config: Some(host_config),
    networking_config: (!endpoints.is_empty()).then(|| NetworkingConfig {
      endpoints_config: endpoints.into_iter().collect(),
    }),
    ..Default::default()
  };

  Ok((config, extra_networks))
}

/// Network ids the container should be attached to, with their endpoint settings.
fn network_endpoints(spec: &ResourceSpec) -> Result<Vec<(String, EndpointSettings)>, RuntimeError> {
  let mut endpoints = Vec::new();
  let Some(networks) = spec.get("networking").and_then(Value::as_array) else {
    return Ok(endpoints);
  };
  for entry in networks {
    let network = entry.get("network").unwrap_or(entry);
    let binding = spec.resolve(network)?;
    let aliases = entry
      .get("aliases")
      .and_then(Value::as_array)
      .map(|list| list.iter().map(scalar_string).collect());
    endpoints.push((
      binding.physical_id.clone(),
      EndpointSettings {
        aliases,
        ..Default::default()
      },
    ));
  }
  Ok(endpoints)
}

/// Decide what to do with an existing container of ours whose labels matched.
///
/// A container with the current configuration hash is only adopted when it is attached to
/// every declared network; one missing an attachment is treated as stale.
fn adoption(
  ownership: Ownership,
  spec: &ResourceSpec,
  attached: &BTreeSet<String>,
) -> Result<Ownership, RuntimeError> {
  if ownership != Ownership::Identical {
    return Ok(ownership);
  }
  let missing = network_endpoints(spec)?
    .into_iter()
    .find(|(network, _)| !attached.contains(network));
  Ok(match missing {
    Some((network, _)) => {
      debug!(container = %spec.name, network = %network, "existing container lacks a network attachment");
      Ownership::Stale
    }
    None => Ownership::Identical,
  })
}

fn mount(spec: &ResourceSpec, target: &str, source: &Value) -> Result<Mount, RuntimeError> {
  let mount = match source {
    Value::String(path) => Mount {
      target: Some(target.to_string()),
      source: Some(path.clone()),
      typ: Some(MountTypeEnum::BIND),
      ..Default::default()
    },
    Value::Object(fields) if decode_ref(source).is_none() => {
      let typ = match fields.get("type").and_then(Value::as_str) {
        Some("tmpfs") => MountTypeEnum::TMPFS,
        _ => MountTypeEnum::BIND,
      };
      Mount {
        target: Some(target.to_string()),
        source: fields.get("source").and_then(Value::as_str).map(str::to_string),
        typ: Some(typ),
        read_only: fields.get("read_only").and_then(Value::as_bool),
        ..Default::default()
      }
    }
    reference => {
      let binding = spec.resolve(reference)?;
      if binding.kind != ResourceKind::Volume {
        return Err(RuntimeError::Rejected(format!(
          "cannot mount {} '{}' at {}",
          binding.kind, binding.name, target
        )));
      }
      Mount {
        target: Some(target.to_string()),
        source: Some(binding.physical_id.clone()),
        typ: Some(MountTypeEnum::VOLUME),
        ..Default::default()
      }
    }
  };
  Ok(mount)
}

fn restart_policy(spec: &ResourceSpec) -> RestartPolicy {
  let name = match spec.get_str("restart") {
    Some("always") => RestartPolicyNameEnum::ALWAYS,
    Some("unless-stopped") => RestartPolicyNameEnum::UNLESS_STOPPED,
    Some("on-failure") => RestartPolicyNameEnum::ON_FAILURE,
    _ => RestartPolicyNameEnum::NO,
  };
  RestartPolicy {
    name: Some(name),
    maximum_retry_count: None,
  }
}

/// A string command is split on whitespace; a list is taken verbatim.
fn command_list(value: &Value) -> Vec<String> {
  match value {
    Value::Array(items) => items.iter().map(scalar_string).collect(),
    other => scalar_string(other).split_whitespace().map(str::to_string).collect(),
  }
}

fn healthcheck(value: &Value) -> HealthConfig {
  let test = value.get("test").map(|test| match test {
    Value::Array(items) => {
      let mut parts: Vec<String> = items.iter().map(scalar_string).collect();
      if !matches!(parts.first().map(String::as_str), Some("CMD" | "CMD-SHELL" | "NONE")) {
        parts.insert(0, "CMD".to_string());
      }
      parts
    }
    other => vec!["CMD-SHELL".to_string(), scalar_string(other)],
  });

  HealthConfig {
    test,
    interval: value.get("interval").and_then(duration_nanos),
    timeout: value.get("timeout").and_then(duration_nanos),
    start_period: value.get("start_period").and_then(duration_nanos),
    retries: value.get("retries").and_then(Value::as_i64),
    ..Default::default()
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use serde_json::json;

  use super::*;
  use crate::resource::LogicalId;
  use crate::runtime::types::{Binding, encode_ref};
  use crate::util::hash::ConfigHash;

  fn binding(kind: ResourceKind, name: &str, id: &str) -> Binding {
    Binding {
      kind,
      name: name.into(),
      physical_id: id.into(),
    }
  }

  fn spec(config: Value) -> ResourceSpec {
    let config: BTreeMap<String, Value> = serde_json::from_value(config).unwrap();
    ResourceSpec {
      session: "web".into(),
      kind: ResourceKind::Container,
      logical_id: "app".into(),
      name: "app".into(),
      config,
      config_hash: ConfigHash("h".into()),
      bindings: BTreeMap::from([
        (LogicalId::from("front"), binding(ResourceKind::Network, "front", "net-front")),
        (LogicalId::from("back"), binding(ResourceKind::Network, "back", "net-back")),
        (LogicalId::from("data"), binding(ResourceKind::Volume, "data", "data")),
      ]),
    }
  }

  fn net(id: &str) -> Value {
    encode_ref(ResourceKind::Network, &LogicalId::from(id), id)
  }

  #[test]
  fn translates_ports_env_and_command() {
    let spec = spec(json!({
      "image": "nginx",
      "ports": { "80": 8080, "53/udp": "127.0.0.1:5353" },
      "environment": { "PORT": 8080, "MODE": "prod" },
      "command": "nginx -g daemon",
    }));
    let (config, extra) = create_config(&spec, "nginx".into()).unwrap();

    assert!(extra.is_empty());
    assert_eq!(config.cmd.unwrap(), vec!["nginx", "-g", "daemon"]);
    let mut env = config.env.unwrap();
    env.sort();
    assert_eq!(env, vec!["MODE=prod", "PORT=8080"]);

    let ports = config.host_config.unwrap().port_bindings.unwrap();
    let tcp = ports["80/tcp"].as_ref().unwrap();
    assert_eq!(tcp[0].host_port.as_deref(), Some("8080"));
    let udp = ports["53/udp"].as_ref().unwrap();
    assert_eq!(udp[0].host_ip.as_deref(), Some("127.0.0.1"));
    assert_eq!(udp[0].host_port.as_deref(), Some("5353"));
    assert!(config.exposed_ports.unwrap().contains_key("80/tcp"));
  }

  #[test]
  fn first_network_at_create_rest_connected_later() {
    let spec = spec(json!({
      "image": "api",
      "networking": [
        { "network": net("back"), "aliases": ["api"] },
        { "network": net("front") },
      ],
    }));
    let (config, extra) = create_config(&spec, "api".into()).unwrap();

    let endpoints = config.networking_config.unwrap().endpoints_config;
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints["net-back"].aliases, Some(vec!["api".to_string()]));
    assert_eq!(extra.len(), 1);
    assert_eq!(extra[0].0, "net-front");
  }

  #[test]
  fn mounts_volumes_and_binds() {
    let spec = spec(json!({
      "image": "postgres",
      "volumes": {
        "/var/lib/postgresql/data": encode_ref(ResourceKind::Volume, &LogicalId::from("data"), "data"),
        "/etc/app": { "type": "bind", "source": "/srv/app", "read_only": true },
        "/tmp/cache": { "type": "tmpfs" },
      },
    }));
    let (config, _) = create_config(&spec, "postgres".into()).unwrap();
    let mounts = config.host_config.unwrap().mounts.unwrap();

    let by_target = |t: &str| mounts.iter().find(|m| m.target.as_deref() == Some(t)).unwrap();
    assert_eq!(by_target("/var/lib/postgresql/data").typ, Some(MountTypeEnum::VOLUME));
    assert_eq!(by_target("/etc/app").read_only, Some(true));
    assert_eq!(by_target("/etc/app").source.as_deref(), Some("/srv/app"));
    assert_eq!(by_target("/tmp/cache").typ, Some(MountTypeEnum::TMPFS));
  }

  #[test]
  fn healthcheck_translation() {
    let health = healthcheck(&json!({
      "test": ["pg_isready", "-U", "postgres"],
      "interval": "5s",
      "retries": 5,
    }));
    assert_eq!(
      health.test.unwrap(),
      vec!["CMD", "pg_isready", "-U", "postgres"]
    );
    assert_eq!(health.interval, Some(5_000_000_000));
    assert_eq!(health.retries, Some(5));

    let shell = healthcheck(&json!({ "test": "curl -f http://localhost" }));
    assert_eq!(shell.test.unwrap()[0], "CMD-SHELL");
  }

  #[test]
  fn restart_policy_mapping() {
    let spec = spec(json!({ "image": "x", "restart": "unless-stopped" }));
    assert_eq!(restart_policy(&spec).name, Some(RestartPolicyNameEnum::UNLESS_STOPPED));
    let spec = super::tests::spec(json!({ "image": "x" }));
    assert_eq!(restart_policy(&spec).name, Some(RestartPolicyNameEnum::NO));
  }

  #[test]
  fn adoption_requires_every_network_attachment() {
    let spec = spec(json!({
      "image": "api",
      "networking": [{ "network": net("back") }, { "network": net("front") }],
    }));

    let both = BTreeSet::from(["net-back".to_string(), "net-front".to_string()]);
    assert_eq!(adoption(Ownership::Identical, &spec, &both).unwrap(), Ownership::Identical);

    let first_only = BTreeSet::from(["net-back".to_string()]);
    assert_eq!(adoption(Ownership::Identical, &spec, &first_only).unwrap(), Ownership::Stale);

    assert_eq!(adoption(Ownership::Foreign, &spec, &both).unwrap(), Ownership::Foreign);
  }

  #[test]
  fn adoption_without_networking_ignores_attachments() {
    let spec = spec(json!({ "image": "api" }));
    let bridge = BTreeSet::from(["bridge".to_string()]);
    assert_eq!(adoption(Ownership::Identical, &spec, &bridge).unwrap(), Ownership::Identical);
  }

  #[test]
  fn unbound_network_is_rejected() {
    let spec = spec(json!({ "image": "x", "networking": [{ "network": net("elsewhere") }] }));
    assert!(create_config(&spec, "x".into()).is_err());
  }
}
