use std::path::Path;

use mlua::prelude::*;

/// Create a Lua VM for evaluating a declaration file.
///
/// `package.path` is extended with `<dir>/lua/?.lua` so declaration files can `require`
/// shared modules kept next to them.
pub fn create_runtime(dir: &Path) -> LuaResult<Lua> {
  let lua = Lua::new();
  let package = lua.globals().get::<LuaTable>("package")?;
  let package_path = package.get::<String>("path")?;
  let lua_dir = dir.join("lua");
  package.set(
    "path",
    format!(
      "{0}/?.lua;{0}/?/init.lua;{1}",
      lua_dir.to_string_lossy(),
      package_path
    ),
  )?;
  Ok(lua)
}

/// Load and execute the Lua file at `path`, returning whatever it returns.
pub fn load_file(lua: &Lua, path: &Path) -> LuaResult<LuaValue> {
  let content = std::fs::read_to_string(path)
    .map_err(|e| LuaError::external(format!("cannot read '{}': {}", path.display(), e)))?;

  lua
    .load(&content)
    .set_name(format!("@{}", path.display()))
    .eval::<LuaValue>()
}
