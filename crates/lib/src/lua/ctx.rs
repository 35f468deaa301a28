//! The `ctx` table handed to a declaration file's `setup` function.
//!
//! - `ctx.image(id, opts)`, `ctx.network(id, opts?)`, `ctx.volume(id, opts?)`,
//!   `ctx.container(id, opts)`, `ctx.mount(id, opts)` - declare a resource, return its handle
//! - `ctx.bind_mount(id, source, opts?)` - shorthand for a bind mount of a host path
//! - `ctx.format(...)` - build a string template from text and handles
//! - `ctx.dir` - directory of the declaration file
//! - `ctx.session` - session name
//!
//! Handles are tables `{ kind, id, name }`. `tostring(handle)` is the runtime name, and
//! `"tcp://" .. handle .. ":5432"` builds a template that renders the name at reconcile time.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::prelude::*;

use crate::consts::{REF_TYPE, TEMPLATE_TYPE};
use crate::resource::{
  Config, ConfigValue, Declarations, Descriptor, DescriptorHandle, ResourceKind, TemplatePart,
};

use super::convert::{options_to_config, template_parts, type_marker};

const HANDLE_MT_KEY: &str = "dockyard.handle_mt";
const TEMPLATE_MT_KEY: &str = "dockyard.template_mt";

/// Build the `ctx` table. Every constructor declares into `declarations`.
pub fn create_ctx(lua: &Lua, declarations: Rc<RefCell<Declarations>>, dir: &Path, session: &str) -> LuaResult<LuaTable> {
  register_metatables(lua)?;

  let ctx = lua.create_table()?;
  ctx.set("dir", dir.to_string_lossy().to_string())?;
  ctx.set("session", session)?;

  for kind in ResourceKind::ALL {
    let decls = declarations.clone();
    let base = dir.to_path_buf();
    let constructor = lua.create_function(move |lua, (id, options): (String, Option<LuaTable>)| {
      let (config, depends_on) = options_to_config(options)?;
      let config = resolve_paths(kind, config, &base);
      let mut descriptor = Descriptor::new(kind, id, config).map_err(LuaError::external)?;
      for target in depends_on {
        descriptor = descriptor.with_dependency(target);
      }
      let handle = decls.borrow_mut().insert(descriptor).map_err(LuaError::external)?;
      handle_table(lua, &handle)
    })?;
    ctx.set(kind.as_str(), constructor)?;
  }

  let decls = declarations;
  let base = dir.to_path_buf();
  let bind_mount = lua.create_function(
    move |lua, (id, source, options): (String, String, Option<LuaTable>)| {
      let (mut config, _) = options_to_config(options)?;
      config.insert("type", "bind");
      config.insert("source", absolute(&base, &source));
      let descriptor = Descriptor::new(ResourceKind::Mount, id, config).map_err(LuaError::external)?;
      let handle = decls.borrow_mut().insert(descriptor).map_err(LuaError::external)?;
      handle_table(lua, &handle)
    },
  )?;
  ctx.set("bind_mount", bind_mount)?;

  let format = lua.create_function(|lua, values: LuaVariadic<LuaValue>| template_table(lua, values.into_iter()))?;
  ctx.set("format", format)?;

  Ok(ctx)
}

/// Turn a declared handle into its Lua table form.
pub fn handle_table(lua: &Lua, handle: &DescriptorHandle) -> LuaResult<LuaTable> {
  let table = lua.create_table()?;
  table.set("kind", handle.kind().as_str())?;
  table.set("id", handle.logical_id().as_str())?;
  table.set("name", handle.runtime_name())?;
  table.set_metatable(Some(lua.named_registry_value::<LuaTable>(HANDLE_MT_KEY)?))?;
  Ok(table)
}

fn register_metatables(lua: &Lua) -> LuaResult<()> {
  let concat = lua.create_function(|lua, (left, right): (LuaValue, LuaValue)| {
    template_table(lua, [left, right].into_iter())
  })?;

  let handle_mt = lua.create_table()?;
  handle_mt.set("__type", REF_TYPE)?;
  handle_mt.set("__concat", concat.clone())?;
  handle_mt.set(
    "__tostring",
    lua.create_function(|_, handle: LuaTable| handle.get::<String>("name"))?,
  )?;
  lua.set_named_registry_value(HANDLE_MT_KEY, handle_mt)?;

  let template_mt = lua.create_table()?;
  template_mt.set("__type", TEMPLATE_TYPE)?;
  template_mt.set("__concat", concat)?;
  template_mt.set(
    "__tostring",
    lua.create_function(|_, template: LuaTable| {
      let rendered: String = template_parts(&template)?
        .into_iter()
        .map(|part| match part {
          TemplatePart::Text(text) => text,
          TemplatePart::Name(target) => format!("${{{}}}", target.id),
        })
        .collect();
      Ok(rendered)
    })?,
  )?;
  lua.set_named_registry_value(TEMPLATE_MT_KEY, template_mt)?;

  Ok(())
}

/// A template table holding `values` in order, with nested templates flattened.
fn template_table(lua: &Lua, values: impl Iterator<Item = LuaValue>) -> LuaResult<LuaTable> {
  let table = lua.create_table()?;
  for value in values {
    let nested = match &value {
      LuaValue::Table(t) => match type_marker(t).as_deref() {
        Some(TEMPLATE_TYPE) => Some(t.clone()),
        Some(REF_TYPE) => None,
        _ => return Err(LuaError::external("cannot use a plain table in a template")),
      },
      LuaValue::String(_) | LuaValue::Integer(_) | LuaValue::Number(_) => None,
      other => {
        return Err(LuaError::external(format!(
          "cannot use a {} in a template",
          other.type_name()
        )));
      }
    };
    match nested {
      Some(template) => {
        for item in template.sequence_values::<LuaValue>() {
          table.raw_push(item?)?;
        }
      }
      None => table.raw_push(value)?,
    }
  }
  table.set_metatable(Some(lua.named_registry_value::<LuaTable>(TEMPLATE_MT_KEY)?))?;
  Ok(table)
}

/// Resolve host paths in an option table against the declaration file's directory.
fn resolve_paths(kind: ResourceKind, mut config: Config, base: &Path) -> Config {
  match kind {
    ResourceKind::Image => {
      if let Some(ConfigValue::Map(build)) = config.get("build") {
        let mut build = build.clone();
        if let Some(ConfigValue::String(context)) = build.get("context") {
          let context = absolute(base, context);
          build.insert("context".to_string(), ConfigValue::String(context));
        }
        config.insert("build", ConfigValue::Map(build));
      }
    }
    ResourceKind::Mount => {
      let is_bind = config.get_str("type").is_none_or(|t| t == "bind");
      if is_bind && let Some(source) = config.get_str("source") {
        let source = absolute(base, source);
        config.insert("source", source);
      }
    }
    _ => {}
  }
  config
}

fn absolute(base: &Path, path: &str) -> String {
  let path = PathBuf::from(path);
  if path.is_absolute() {
    path.to_string_lossy().to_string()
  } else {
    base.join(path).to_string_lossy().to_string()
  }
}
