//! Recognized options per resource kind.
//!
//! Each kind has an explicit table of the options it accepts and the shape each value must
//! take. Unknown options and malformed values are rejected when the descriptor is declared.

use std::collections::BTreeMap;

use super::error::ConfigurationError;
use super::types::{Config, ConfigValue, LogicalId, ResourceKind};

/// Value shapes an option may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
  /// Plain string or template.
  String,
  Bool,
  Integer,
  /// Human-readable duration (`"10s"`, `"1m 30s"`) or whole seconds.
  Duration,
  Choice(&'static [&'static str]),
  /// A single string or a list of strings.
  Command,
  /// Map of string keys to scalar values or templates.
  StringMap,
  /// Image handle or an unmanaged image reference string.
  Image,
  /// Map of container port (`"80"`, `"53/udp"`) to host port.
  Ports,
  /// Map of container path to a volume handle, mount handle, inline mount table or host path.
  Volumes,
  /// List of network handles, or `{ network = handle, aliases = {...} }` tables.
  Networking,
  Healthcheck,
  Build,
}

/// Describes one recognized option.
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
  pub name: &'static str,
  pub shape: Shape,
  pub required: bool,
}

const fn opt(name: &'static str, shape: Shape) -> OptionSpec {
  OptionSpec {
    name,
    shape,
    required: false,
  }
}

const fn required(name: &'static str, shape: Shape) -> OptionSpec {
  OptionSpec {
    name,
    shape,
    required: true,
  }
}

pub const PULL_POLICIES: &[&str] = &["always", "missing", "never"];
pub const RESTART_POLICIES: &[&str] = &["no", "always", "unless-stopped", "on-failure"];
pub const CONTAINER_STATES: &[&str] = &["running", "created", "stopped"];
pub const MOUNT_TYPES: &[&str] = &["bind", "tmpfs"];

const IMAGE_OPTIONS: &[OptionSpec] = &[
  required("ref", Shape::String),
  opt("build", Shape::Build),
  opt("pull", Shape::Choice(PULL_POLICIES)),
];

const NETWORK_OPTIONS: &[OptionSpec] = &[
  opt("name", Shape::String),
  opt("driver", Shape::String),
  opt("internal", Shape::Bool),
  opt("attachable", Shape::Bool),
  opt("labels", Shape::StringMap),
];

const VOLUME_OPTIONS: &[OptionSpec] = &[
  opt("name", Shape::String),
  opt("driver", Shape::String),
  opt("driver_opts", Shape::StringMap),
  opt("labels", Shape::StringMap),
];

const CONTAINER_OPTIONS: &[OptionSpec] = &[
  opt("name", Shape::String),
  required("image", Shape::Image),
  opt("command", Shape::Command),
  opt("entrypoint", Shape::Command),
  opt("environment", Shape::StringMap),
  opt("ports", Shape::Ports),
  opt("volumes", Shape::Volumes),
  opt("networking", Shape::Networking),
  opt("healthcheck", Shape::Healthcheck),
  opt("restart", Shape::Choice(RESTART_POLICIES)),
  opt("status", Shape::Choice(CONTAINER_STATES)),
  opt("labels", Shape::StringMap),
  opt("working_dir", Shape::String),
  opt("user", Shape::String),
  opt("hostname", Shape::String),
];

const MOUNT_OPTIONS: &[OptionSpec] = &[
  opt("type", Shape::Choice(MOUNT_TYPES)),
  opt("source", Shape::String),
  opt("read_only", Shape::Bool),
];

const HEALTHCHECK_KEYS: &[&str] = &["test", "interval", "timeout", "retries", "start_period"];
const BUILD_KEYS: &[&str] = &["context", "dockerfile", "args"];
const MOUNT_KEYS: &[&str] = &["type", "source", "read_only"];
const ENDPOINT_KEYS: &[&str] = &["network", "aliases"];

/// Options a kind accepts.
pub fn option_specs(kind: ResourceKind) -> &'static [OptionSpec] {
  match kind {
    ResourceKind::Image => IMAGE_OPTIONS,
    ResourceKind::Network => NETWORK_OPTIONS,
    ResourceKind::Volume => VOLUME_OPTIONS,
    ResourceKind::Container => CONTAINER_OPTIONS,
    ResourceKind::Mount => MOUNT_OPTIONS,
  }
}

/// Options whose changes the runtime can apply without recreating the resource.
pub fn in_place_options(kind: ResourceKind) -> &'static [&'static str] {
  match kind {
    ResourceKind::Container => &["restart", "status"],
    _ => &[],
  }
}

/// Validate a descriptor's options against its kind's table.
pub fn validate(kind: ResourceKind, id: &LogicalId, config: &Config) -> Result<(), ConfigurationError> {
  let specs = option_specs(kind);

  for (name, value) in config.iter() {
    let Some(spec) = specs.iter().find(|spec| spec.name == name) else {
      return Err(ConfigurationError::UnknownOption {
        kind,
        id: id.clone(),
        option: name.clone(),
      });
    };
    check_shape(spec.shape, value).map_err(|reason| ConfigurationError::InvalidOption {
      kind,
      id: id.clone(),
      option: name.clone(),
      reason,
    })?;
  }

  for spec in specs.iter().filter(|spec| spec.required) {
    if config.get(spec.name).is_none() {
      return Err(ConfigurationError::MissingOption {
        kind,
        id: id.clone(),
        option: spec.name.to_string(),
      });
    }
  }

  if kind == ResourceKind::Mount {
    check_mount(&mount_fields(config)).map_err(|reason| ConfigurationError::InvalidOption {
      kind,
      id: id.clone(),
      option: "source".to_string(),
      reason,
    })?;
  }

  Ok(())
}

fn mount_fields(config: &Config) -> BTreeMap<String, ConfigValue> {
  config.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn check_shape(shape: Shape, value: &ConfigValue) -> Result<(), String> {
  match shape {
    Shape::String => expect_text(value),
    Shape::Bool => match value {
      ConfigValue::Bool(_) => Ok(()),
      other => Err(format!("must be a boolean, got {}", other.type_name())),
    },
    Shape::Integer => match value {
      ConfigValue::Integer(_) => Ok(()),
      other => Err(format!("must be an integer, got {}", other.type_name())),
    },
    Shape::Duration => check_duration(value),
    Shape::Choice(choices) => match value {
      ConfigValue::String(s) if choices.contains(&s.as_str()) => Ok(()),
      _ => Err(format!("must be one of: {}", choices.join(", "))),
    },
    Shape::Command => match value {
      ConfigValue::String(_) | ConfigValue::Template(_) => Ok(()),
      ConfigValue::List(items) => items.iter().try_for_each(expect_text),
      other => Err(format!("must be a string or a list of strings, got {}", other.type_name())),
    },
    Shape::StringMap => {
      let map = expect_map(value)?;
      for (key, entry) in map {
        match entry {
          ConfigValue::String(_)
          | ConfigValue::Template(_)
          | ConfigValue::Integer(_)
          | ConfigValue::Float(_)
          | ConfigValue::Bool(_) => {}
          other => return Err(format!("entry '{}' must be a scalar, got {}", key, other.type_name())),
        }
      }
      Ok(())
    }
    Shape::Image => match value {
      ConfigValue::String(_) => Ok(()),
      ConfigValue::Ref(r) if r.kind == ResourceKind::Image => Ok(()),
      other => Err(format!("must be an image handle or reference string, got {}", other.type_name())),
    },
    Shape::Ports => {
      for (port, host) in expect_map(value)? {
        if !is_container_port(port) {
          return Err(format!("has invalid container port '{}'", port));
        }
        match host {
          ConfigValue::Integer(p) if (1..=65535).contains(p) => {}
          ConfigValue::String(s) if !s.is_empty() => {}
          _ => return Err(format!("maps port '{}' to an invalid host port", port)),
        }
      }
      Ok(())
    }
    Shape::Volumes => {
      for (target, source) in expect_map(value)? {
        if !target.starts_with('/') {
          return Err(format!("target '{}' must be an absolute container path", target));
        }
        match source {
          ConfigValue::String(s) if !s.is_empty() => {}
          ConfigValue::Ref(r) if matches!(r.kind, ResourceKind::Volume | ResourceKind::Mount) => {}
          ConfigValue::Map(fields) => {
            expect_keys(fields, MOUNT_KEYS)?;
            check_mount(fields)?;
          }
          other => {
            return Err(format!(
              "target '{}' must be a volume, a mount or a host path, got {}",
              target,
              other.type_name()
            ));
          }
        }
      }
      Ok(())
    }
    Shape::Networking => {
      let ConfigValue::List(entries) = value else {
        return Err(format!("must be a list of networks, got {}", value.type_name()));
      };
      for entry in entries {
        match entry {
          ConfigValue::Ref(r) if r.kind == ResourceKind::Network => {}
          ConfigValue::Map(fields) => {
            expect_keys(fields, ENDPOINT_KEYS)?;
            match fields.get("network") {
              Some(ConfigValue::Ref(r)) if r.kind == ResourceKind::Network => {}
              _ => return Err("entries must name a network handle".to_string()),
            }
            if let Some(aliases) = fields.get("aliases") {
              check_shape(Shape::Command, aliases).map_err(|e| format!("aliases {}", e))?;
            }
          }
          other => return Err(format!("entries must be network handles, got {}", other.type_name())),
        }
      }
      Ok(())
    }
    Shape::Healthcheck => {
      let map = expect_map(value)?;
      expect_keys(map, HEALTHCHECK_KEYS)?;
      let Some(test) = map.get("test") else {
        return Err("requires a 'test' command".to_string());
      };
      check_shape(Shape::Command, test).map_err(|e| format!("test {}", e))?;
      for key in ["interval", "timeout", "start_period"] {
        if let Some(duration) = map.get(key) {
          check_duration(duration).map_err(|e| format!("{} {}", key, e))?;
        }
      }
      if let Some(retries) = map.get("retries") {
        check_shape(Shape::Integer, retries).map_err(|e| format!("retries {}", e))?;
      }
      Ok(())
    }
    Shape::Build => {
      let map = expect_map(value)?;
      expect_keys(map, BUILD_KEYS)?;
      match map.get("context") {
        Some(ConfigValue::String(s)) if !s.is_empty() => {}
        _ => return Err("requires a 'context' directory".to_string()),
      }
      if let Some(dockerfile) = map.get("dockerfile") {
        expect_text(dockerfile).map_err(|e| format!("dockerfile {}", e))?;
      }
      if let Some(args) = map.get("args") {
        check_shape(Shape::StringMap, args).map_err(|e| format!("args {}", e))?;
      }
      Ok(())
    }
  }
}

fn check_mount(fields: &BTreeMap<String, ConfigValue>) -> Result<(), String> {
  let mount_type = match fields.get("type") {
    None => "bind",
    Some(ConfigValue::String(s)) if MOUNT_TYPES.contains(&s.as_str()) => s.as_str(),
    Some(_) => return Err(format!("mount type must be one of: {}", MOUNT_TYPES.join(", "))),
  };
  if let Some(read_only) = fields.get("read_only") {
    check_shape(Shape::Bool, read_only).map_err(|e| format!("read_only {}", e))?;
  }
  match (mount_type, fields.get("source")) {
    ("bind", Some(ConfigValue::String(s))) if !s.is_empty() => Ok(()),
    ("bind", _) => Err("bind mounts require a host 'source' path".to_string()),
    (_, None) => Ok(()),
    (_, Some(_)) => Err("tmpfs mounts do not take a 'source'".to_string()),
  }
}

fn check_duration(value: &ConfigValue) -> Result<(), String> {
  match value {
    ConfigValue::Integer(secs) if *secs >= 0 => Ok(()),
    ConfigValue::String(s) => humantime::parse_duration(s)
      .map(|_| ())
      .map_err(|e| format!("is not a valid duration: {}", e)),
    other => Err(format!("must be a duration, got {}", other.type_name())),
  }
}

fn expect_text(value: &ConfigValue) -> Result<(), String> {
  match value {
    ConfigValue::String(_) | ConfigValue::Template(_) => Ok(()),
    other => Err(format!("must be a string, got {}", other.type_name())),
  }
}

fn expect_map(value: &ConfigValue) -> Result<&BTreeMap<String, ConfigValue>, String> {
  value
    .as_map()
    .ok_or_else(|| format!("must be a table, got {}", value.type_name()))
}

fn expect_keys(map: &BTreeMap<String, ConfigValue>, allowed: &[&str]) -> Result<(), String> {
  match map.keys().find(|key| !allowed.contains(&key.as_str())) {
    Some(key) => Err(format!("has unknown field '{}' (expected one of: {})", key, allowed.join(", "))),
    None => Ok(()),
  }
}

fn is_container_port(port: &str) -> bool {
  let (number, protocol) = port.split_once('/').unwrap_or((port, "tcp"));
  matches!(protocol, "tcp" | "udp" | "sctp") && number.parse::<u16>().is_ok_and(|n| n > 0)
}

/// Parse a duration option value (already validated) into nanoseconds, as the Docker API expects.
pub fn duration_nanos(value: &serde_json::Value) -> Option<i64> {
  match value {
    serde_json::Value::Number(n) => n.as_i64().map(|secs| secs.saturating_mul(1_000_000_000)),
    serde_json::Value::String(s) => humantime::parse_duration(s)
      .ok()
      .and_then(|d| i64::try_from(d.as_nanos()).ok()),
    _ => None,
  }
}
