//! Conversion of Lua option tables into configuration values.
//!
//! Handle tables (returned by `ctx.network(...)` and friends) carry a metatable whose
//! `__type` is [`REF_TYPE`]; they convert to [`ConfigValue::Ref`]. Tables produced by `..`
//! on a handle, or by `ctx.format`, are marked [`TEMPLATE_TYPE`] and convert to
//! [`ConfigValue::Template`].

use std::collections::BTreeMap;

use mlua::prelude::*;

use crate::consts::{REF_TYPE, TEMPLATE_TYPE};
use crate::resource::{Config, ConfigValue, ResourceKind, ResourceRef, TemplatePart};

/// The `__type` marker of a table's metatable, if any.
pub fn type_marker(table: &LuaTable) -> Option<String> {
  table.metatable().and_then(|mt| mt.get::<String>("__type").ok())
}

/// Read a handle table back into a reference.
pub fn handle_to_ref(table: &LuaTable) -> LuaResult<ResourceRef> {
  let kind: String = table.get("kind")?;
  let id: String = table.get("id")?;
  let kind = kind.parse::<ResourceKind>().map_err(LuaError::external)?;
  Ok(ResourceRef::new(kind, id))
}

pub fn is_handle(value: &LuaValue) -> bool {
  matches!(value, LuaValue::Table(t) if type_marker(t).as_deref() == Some(REF_TYPE))
}

/// Convert any Lua value accepted in an option table.
pub fn lua_to_config_value(value: LuaValue) -> LuaResult<ConfigValue> {
  match value {
    LuaValue::String(s) => Ok(ConfigValue::String(s.to_str()?.to_string())),
    LuaValue::Integer(i) => Ok(ConfigValue::Integer(i)),
    LuaValue::Number(n) => Ok(ConfigValue::Float(n)),
    LuaValue::Boolean(b) => Ok(ConfigValue::Bool(b)),
    LuaValue::Table(t) => match type_marker(&t).as_deref() {
      Some(REF_TYPE) => Ok(ConfigValue::Ref(handle_to_ref(&t)?)),
      Some(TEMPLATE_TYPE) => Ok(ConfigValue::Template(template_parts(&t)?)),
      _ => table_to_config_value(t),
    },
    other => Err(LuaError::external(format!(
      "unsupported option value of type {}",
      other.type_name()
    ))),
  }
}

fn table_to_config_value(table: LuaTable) -> LuaResult<ConfigValue> {
  let len = table.raw_len();
  if len > 0 {
    let mut items = Vec::with_capacity(len);
    for value in table.sequence_values::<LuaValue>() {
      items.push(lua_to_config_value(value?)?);
    }
    return Ok(ConfigValue::List(items));
  }

  let mut map = BTreeMap::new();
  for pair in table.pairs::<LuaValue, LuaValue>() {
    let (key, value) = pair?;
    let key = match key {
      LuaValue::String(s) => s.to_str()?.to_string(),
      LuaValue::Integer(i) => i.to_string(),
      other => {
        return Err(LuaError::external(format!(
          "option table keys must be strings, got {}",
          other.type_name()
        )));
      }
    };
    map.insert(key, lua_to_config_value(value)?);
  }
  Ok(ConfigValue::Map(map))
}

/// Parts of a template table, in order.
pub fn template_parts(table: &LuaTable) -> LuaResult<Vec<TemplatePart>> {
  let mut parts = Vec::new();
  for value in table.sequence_values::<LuaValue>() {
    push_part(&mut parts, value?)?;
  }
  Ok(parts)
}

/// Append a value to a template, merging adjacent text.
pub fn push_part(parts: &mut Vec<TemplatePart>, value: LuaValue) -> LuaResult<()> {
  let part = match value {
    LuaValue::String(s) => TemplatePart::Text(s.to_str()?.to_string()),
    LuaValue::Integer(i) => TemplatePart::Text(i.to_string()),
    LuaValue::Number(n) => TemplatePart::Text(n.to_string()),
    LuaValue::Table(t) => match type_marker(&t).as_deref() {
      Some(REF_TYPE) => TemplatePart::Name(handle_to_ref(&t)?),
      Some(TEMPLATE_TYPE) => {
        for part in template_parts(&t)? {
          append(parts, part);
        }
        return Ok(());
      }
      _ => return Err(LuaError::external("cannot concatenate a plain table into a template")),
    },
    other => {
      return Err(LuaError::external(format!(
        "cannot concatenate a {} into a template",
        other.type_name()
      )));
    }
  };
  append(parts, part);
  Ok(())
}

fn append(parts: &mut Vec<TemplatePart>, part: TemplatePart) {
  if let (Some(TemplatePart::Text(last)), TemplatePart::Text(text)) = (parts.last_mut(), &part) {
    last.push_str(text);
    return;
  }
  parts.push(part);
}

/// Convert a constructor's option table.
///
/// `depends_on` is pulled out as explicit ordering edges. `networking` may be a list of
/// handles or endpoint tables, or a table keyed by network handles whose values carry the
/// endpoint settings (`{ [net] = { aliases = {...} } }`).
pub fn options_to_config(options: Option<LuaTable>) -> LuaResult<(Config, Vec<ResourceRef>)> {
  let mut config = Config::new();
  let mut depends_on = Vec::new();
  let Some(options) = options else {
    return Ok((config, depends_on));
  };

  for pair in options.pairs::<String, LuaValue>() {
    let (key, value) = pair?;
    match key.as_str() {
      "depends_on" => depends_on = handle_list(value)?,
      "networking" => {
        config.insert(key, networking(value)?);
      }
      _ => {
        config.insert(key, lua_to_config_value(value)?);
      }
    }
  }

  Ok((config, depends_on))
}

fn handle_list(value: LuaValue) -> LuaResult<Vec<ResourceRef>> {
  match value {
    LuaValue::Table(t) if type_marker(&t).as_deref() == Some(REF_TYPE) => Ok(vec![handle_to_ref(&t)?]),
    LuaValue::Table(t) => t
      .sequence_values::<LuaTable>()
      .map(|handle| handle.and_then(|h| handle_to_ref(&h)))
      .collect(),
    other => Err(LuaError::external(format!(
      "depends_on must be a handle or a list of handles, got {}",
      other.type_name()
    ))),
  }
}

fn networking(value: LuaValue) -> LuaResult<ConfigValue> {
  let LuaValue::Table(table) = value else {
    return lua_to_config_value(value);
  };
  if table.raw_len() > 0 || type_marker(&table).is_some() {
    return lua_to_config_value(LuaValue::Table(table));
  }

  let mut entries: Vec<(ResourceRef, ConfigValue)> = Vec::new();
  for pair in table.pairs::<LuaValue, LuaValue>() {
    let (key, settings) = pair?;
    let LuaValue::Table(handle) = &key else {
      return Err(LuaError::external("networking keys must be network handles"));
    };
    if !is_handle(&key) {
      return Err(LuaError::external("networking keys must be network handles"));
    }
    let network = handle_to_ref(handle)?;

    let mut endpoint = BTreeMap::new();
    endpoint.insert("network".to_string(), ConfigValue::Ref(network.clone()));
    if let ConfigValue::Map(fields) = lua_to_config_value(settings)? {
      endpoint.extend(fields);
    }
    entries.push((network, ConfigValue::Map(endpoint)));
  }

  // Lua iterates hash keys in no particular order.
  entries.sort_by(|a, b| a.0.id.cmp(&b.0.id));
  Ok(ConfigValue::List(entries.into_iter().map(|(_, entry)| entry).collect()))
}
