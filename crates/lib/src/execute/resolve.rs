//! Canonical rendering of declared configuration.
//!
//! Before any runtime call, every descriptor's option bag is rendered to canonical JSON:
//! references become `{"$ref": {kind, id, name}}` markers, templates become plain strings,
//! mount references are inlined and networking entries are sorted. The configuration hash
//! is computed over this form, so it changes exactly when the runtime would see a different
//! request. Physical ids never appear here; they are bound per run in [`Desired::spec`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::resource::{
  ConfigValue, ConfigurationError, Declarations, Descriptor, LogicalId, RefMode, ResourceKind, ResourceRef,
  TemplatePart,
};
use crate::runtime::{Binding, ResourceSpec, encode_ref};
use crate::util::hash::{ConfigHash, Hashable, context_digest};

use super::dag::ResourceDag;
use super::types::ReconcileError;

/// Directory entries left out of build context hashes.
const CONTEXT_EXCLUDES: &[&str] = &[".git"];

/// A descriptor with its configuration rendered and hashed.
#[derive(Debug, Clone)]
pub(crate) struct Desired {
  pub descriptor: Arc<Descriptor>,
  pub name: String,
  pub config: BTreeMap<String, Value>,
  pub config_hash: ConfigHash,
  /// Managed dependencies whose physical id this resource embeds.
  pub bindings: BTreeSet<LogicalId>,
}

impl Desired {
  pub fn kind(&self) -> ResourceKind {
    self.descriptor.kind()
  }

  pub fn logical_id(&self) -> &LogicalId {
    self.descriptor.logical_id()
  }

  /// Build the runtime request, binding each embedded dependency to its current physical id.
  pub fn spec(&self, session: &str, current: &BTreeMap<LogicalId, Binding>) -> ResourceSpec {
    ResourceSpec {
      session: session.to_string(),
      kind: self.kind(),
      logical_id: self.logical_id().clone(),
      name: self.name.clone(),
      config: self.config.clone(),
      config_hash: self.config_hash.clone(),
      bindings: self
        .bindings
        .iter()
        .filter_map(|id| current.get(id).map(|binding| (id.clone(), binding.clone())))
        .collect(),
    }
  }
}

#[derive(Serialize)]
struct HashInput<'a> {
  kind: ResourceKind,
  name: &'a str,
  config: &'a BTreeMap<String, Value>,
}

impl Hashable for HashInput<'_> {}

/// Render every descriptor, dependencies first.
pub(crate) fn resolve_all(
  declarations: &Declarations,
  dag: &ResourceDag,
) -> Result<BTreeMap<LogicalId, Desired>, ReconcileError> {
  let mut resolved: BTreeMap<LogicalId, Desired> = BTreeMap::new();

  for id in dag.topological_order() {
    let Some(descriptor) = declarations.get(id) else {
      continue;
    };
    let desired = resolve(descriptor, &resolved)?;
    resolved.insert(id.clone(), desired);
  }

  Ok(resolved)
}

fn resolve(descriptor: &Arc<Descriptor>, resolved: &BTreeMap<LogicalId, Desired>) -> Result<Desired, ReconcileError> {
  let renderer = Renderer {
    from: descriptor.logical_id(),
    resolved,
  };
  let mut config = BTreeMap::new();

  for (key, value) in descriptor.config().iter() {
    let rendered = match key.as_str() {
      "networking" => renderer.networking(value)?,
      _ => renderer.render(value)?,
    };
    config.insert(key.clone(), rendered);
  }

  if descriptor.kind() == ResourceKind::Image
    && let Some(Value::Object(build)) = config.get_mut("build")
    && let Some(context) = build.get("context").and_then(Value::as_str)
  {
    let digest = context_digest(Path::new(context), CONTEXT_EXCLUDES).map_err(|e| ConfigurationError::InvalidOption {
      kind: ResourceKind::Image,
      id: descriptor.logical_id().clone(),
      option: "build".to_string(),
      reason: format!("cannot read build context '{}': {}", context, e),
    })?;
    build.insert("context_hash".to_string(), Value::String(digest));
  }

  let name_key = match descriptor.kind() {
    ResourceKind::Image => "ref",
    _ => "name",
  };
  let name = config
    .get(name_key)
    .and_then(Value::as_str)
    .map(str::to_string)
    .unwrap_or_else(|| descriptor.logical_id().to_string());

  let config_hash = HashInput {
    kind: descriptor.kind(),
    name: &name,
    config: &config,
  }
  .compute_hash()
  .map_err(|source| ReconcileError::Hash {
    id: descriptor.logical_id().clone(),
    source,
  })?;

  let bindings = descriptor
    .references()
    .iter()
    .filter(|r| r.mode == RefMode::Physical && r.target.kind.is_managed())
    .map(|r| r.target.id.clone())
    .collect();

  Ok(Desired {
    descriptor: descriptor.clone(),
    name,
    config,
    config_hash,
    bindings,
  })
}

struct Renderer<'a> {
  from: &'a LogicalId,
  resolved: &'a BTreeMap<LogicalId, Desired>,
}

impl Renderer<'_> {
  fn render(&self, value: &ConfigValue) -> Result<Value, ConfigurationError> {
    let rendered = match value {
      ConfigValue::String(s) => Value::String(s.clone()),
      ConfigValue::Integer(i) => Value::Number((*i).into()),
      ConfigValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
      ConfigValue::Bool(b) => Value::Bool(*b),
      ConfigValue::List(items) => Value::Array(items.iter().map(|item| self.render(item)).collect::<Result<_, _>>()?),
      ConfigValue::Map(map) => {
        let mut object = Map::new();
        for (key, value) in map {
          object.insert(key.clone(), self.render(value)?);
        }
        Value::Object(object)
      }
      ConfigValue::Ref(target) => self.reference(target)?,
      ConfigValue::Template(parts) => {
        let mut out = String::new();
        for part in parts {
          match part {
            TemplatePart::Text(text) => out.push_str(text),
            TemplatePart::Name(target) => out.push_str(&self.target(target)?.name),
          }
        }
        Value::String(out)
      }
    };
    Ok(rendered)
  }

  /// Mounts are never created on their own, so their configuration is inlined.
  fn reference(&self, target: &ResourceRef) -> Result<Value, ConfigurationError> {
    let desired = self.target(target)?;
    if target.kind != ResourceKind::Mount {
      return Ok(encode_ref(target.kind, &target.id, &desired.name));
    }

    let mut mount: Map<String, Value> = desired.config.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    mount
      .entry("type".to_string())
      .or_insert_with(|| Value::String("bind".to_string()));
    Ok(Value::Object(mount))
  }

  fn target(&self, target: &ResourceRef) -> Result<&Desired, ConfigurationError> {
    // Dependencies resolve first, so a miss means the id was never declared.
    self
      .resolved
      .get(&target.id)
      .ok_or_else(|| ConfigurationError::UnresolvedReference {
        from: self.from.clone(),
        target: target.id.clone(),
      })
  }

  /// Normalize networking to `[{network, aliases}]`, ordered by network id.
  fn networking(&self, value: &ConfigValue) -> Result<Value, ConfigurationError> {
    let ConfigValue::List(entries) = value else {
      return self.render(value);
    };

    let mut endpoints: Vec<(LogicalId, Value)> = Vec::with_capacity(entries.len());
    for entry in entries {
      let (network, aliases) = match entry {
        ConfigValue::Ref(network) => (network, None),
        ConfigValue::Map(fields) => match fields.get("network") {
          Some(ConfigValue::Ref(network)) => (network, fields.get("aliases")),
          _ => continue,
        },
        _ => continue,
      };

      let aliases = match aliases.map(|a| self.render(a)).transpose()? {
        Some(Value::Array(list)) => list,
        Some(single) => vec![single],
        None => Vec::new(),
      };
      let mut endpoint = Map::new();
      endpoint.insert("network".to_string(), self.reference(network)?);
      endpoint.insert("aliases".to_string(), Value::Array(aliases));
      endpoints.push((network.id.clone(), Value::Object(endpoint)));
    }

    endpoints.sort_by(|a, b| a.0.cmp(&b.0));
    endpoints.dedup_by(|a, b| a.0 == b.0);
    Ok(Value::Array(endpoints.into_iter().map(|(_, v)| v).collect()))
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;
  use tempfile::TempDir;

  use super::*;
  use crate::resource::Config;

  fn resolve_declarations(declarations: &Declarations) -> BTreeMap<LogicalId, Desired> {
    let dag = ResourceDag::from_declarations(declarations).unwrap();
    resolve_all(declarations, &dag).unwrap()
  }

  fn desired<'a>(resolved: &'a BTreeMap<LogicalId, Desired>, id: &str) -> &'a Desired {
    &resolved[&LogicalId::from(id)]
  }

  #[test]
  fn references_render_without_physical_ids() {
    let mut decls = Declarations::new();
    let net = decls
      .declare(ResourceKind::Network, "n1", Config::new().with("name", "backend"))
      .unwrap();
    decls
      .declare(
        ResourceKind::Container,
        "c1",
        Config::new()
          .with("image", "nginx")
          .with("networking", ConfigValue::list([net.reference()])),
      )
      .unwrap();

    let resolved = resolve_declarations(&decls);
    let c1 = desired(&resolved, "c1");
    assert_eq!(
      c1.config["networking"],
      json!([{ "network": { "$ref": { "kind": "network", "id": "n1", "name": "backend" } }, "aliases": [] }])
    );
    assert_eq!(c1.bindings, BTreeSet::from([LogicalId::from("n1")]));
  }

  #[test]
  fn templates_render_names() {
    let mut decls = Declarations::new();
    let db = decls
      .declare(
        ResourceKind::Container,
        "db",
        Config::new().with("image", "postgres").with("name", "pg-main"),
      )
      .unwrap();
    decls
      .declare(
        ResourceKind::Container,
        "api",
        Config::new().with("image", "api").with(
          "environment",
          ConfigValue::map([(
            "DATABASE_URL",
            ConfigValue::Template(vec![
              TemplatePart::Text("postgres://".into()),
              db.name(),
              TemplatePart::Text(":5432/app".into()),
            ]),
          )]),
        ),
      )
      .unwrap();

    let resolved = resolve_declarations(&decls);
    let api = desired(&resolved, "api");
    assert_eq!(api.config["environment"]["DATABASE_URL"], "postgres://pg-main:5432/app");
    assert!(api.bindings.is_empty(), "name-only references do not bind physical ids");
  }

  #[test]
  fn mounts_are_inlined() {
    let mut decls = Declarations::new();
    let mount = decls
      .declare(
        ResourceKind::Mount,
        "conf",
        Config::new().with("source", "/srv/conf").with("read_only", true),
      )
      .unwrap();
    decls
      .declare(
        ResourceKind::Container,
        "web",
        Config::new()
          .with("image", "nginx")
          .with("volumes", ConfigValue::map([("/etc/nginx", mount.reference())])),
      )
      .unwrap();

    let resolved = resolve_declarations(&decls);
    let web = desired(&resolved, "web");
    assert_eq!(
      web.config["volumes"]["/etc/nginx"],
      json!({ "type": "bind", "source": "/srv/conf", "read_only": true })
    );
    assert!(web.bindings.is_empty());
  }

  #[test]
  fn networking_order_does_not_change_hash() {
    let build = |order: [&str; 2]| {
      let mut decls = Declarations::new();
      let a = decls.declare(ResourceKind::Network, "a", Config::new()).unwrap();
      let b = decls.declare(ResourceKind::Network, "b", Config::new()).unwrap();
      let handles = |id: &str| if id == "a" { a.reference() } else { b.reference() };
      decls
        .declare(
          ResourceKind::Container,
          "c",
          Config::new()
            .with("image", "x")
            .with("networking", ConfigValue::list(order.map(handles))),
        )
        .unwrap();
      desired(&resolve_declarations(&decls), "c").config_hash.clone()
    };

    assert_eq!(build(["a", "b"]), build(["b", "a"]));
  }

  #[test]
  fn hash_tracks_config_and_name() {
    let hash = |config: Config| {
      let mut decls = Declarations::new();
      decls.declare(ResourceKind::Network, "n1", config).unwrap();
      desired(&resolve_declarations(&decls), "n1").config_hash.clone()
    };

    let base = hash(Config::new());
    assert_eq!(base, hash(Config::new()));
    assert_ne!(base, hash(Config::new().with("internal", true)));
    assert_ne!(base, hash(Config::new().with("name", "other")));
    assert_eq!(base.0.len(), 20);
  }

  #[test]
  fn build_context_contents_feed_the_hash() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("Dockerfile"), "FROM scratch\n").unwrap();
    let context = temp.path().to_string_lossy().to_string();

    let hash = || {
      let mut decls = Declarations::new();
      decls
        .declare(
          ResourceKind::Image,
          "app",
          Config::new()
            .with("ref", "app:dev")
            .with("build", ConfigValue::map([("context", context.clone())])),
        )
        .unwrap();
      let resolved = resolve_declarations(&decls);
      let app = desired(&resolved, "app");
      assert!(app.config["build"]["context_hash"].is_string());
      app.config_hash.clone()
    };

    let before = hash();
    assert_eq!(before, hash());
    std::fs::write(temp.path().join("Dockerfile"), "FROM alpine\n").unwrap();
    assert_ne!(before, hash());
  }

  #[test]
  fn missing_build_context_is_a_configuration_error() {
    let mut decls = Declarations::new();
    decls
      .declare(
        ResourceKind::Image,
        "app",
        Config::new()
          .with("ref", "app:dev")
          .with("build", ConfigValue::map([("context", "/definitely/not/here")])),
      )
      .unwrap();
    let dag = ResourceDag::from_declarations(&decls).unwrap();

    let err = resolve_all(&decls, &dag).unwrap_err();
    assert!(matches!(
      err,
      ReconcileError::Configuration(ConfigurationError::InvalidOption { ref option, .. }) if option == "build"
    ));
  }

  #[test]
  fn spec_binds_current_physical_ids() {
    let mut decls = Declarations::new();
    let net = decls.declare(ResourceKind::Network, "n1", Config::new()).unwrap();
    decls
      .declare(
        ResourceKind::Container,
        "c1",
        Config::new()
          .with("image", "x")
          .with("networking", ConfigValue::list([net.reference()])),
      )
      .unwrap();
    let resolved = resolve_declarations(&decls);

    let current = BTreeMap::from([(
      LogicalId::from("n1"),
      Binding {
        kind: ResourceKind::Network,
        name: "n1".into(),
        physical_id: "net-0001".into(),
      },
    )]);
    let spec = desired(&resolved, "c1").spec("web", &current);
    assert_eq!(spec.bindings[&LogicalId::from("n1")].physical_id, "net-0001");
    assert_eq!(spec.session, "web");
  }
}
