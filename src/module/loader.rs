//! Peer-side Lua evaluation of master-delivered module source (spec §4.8,
//! §8 S1/S2). Where `os`/`builtins` in [`super::registry`] are interpreter
//! built-ins baked into every peer binary and never touch the wire,
//! everything else arrives lazily: [`ModuleLoader::call`] drives
//! [`super::importer::Importer::import_chain`] to fetch a module and its
//! dependency closure, evaluates each chunk in dependency order, and parks
//! the resulting export table in Lua's own `package.loaded` so a
//! dependent module's plain `require(name)` call finds it already cached
//! rather than going looking for a file on disk that does not exist.

use std::io::Read;
use std::sync::{Arc, Mutex};

use mlua::{Function as LuaFunction, Lua, Table, Value as LuaValue};

use crate::error::{Error, Result};
use crate::value::{CallError, Value};

use super::importer::Importer;

/// Owns one peer's Lua interpreter state and the importer it pulls
/// module source through.
pub struct ModuleLoader {
    lua: Mutex<Lua>,
    importer: Arc<Importer>,
}

impl ModuleLoader {
    #[must_use]
    pub fn new(importer: Arc<Importer>) -> Self {
        Self { lua: Mutex::new(Lua::new()), importer }
    }

    /// Resolve and call `module[.class].func(*args)` (spec §4.7 step 6,
    /// `CALL_FUNCTION` dispatch), loading `module` and its dependencies
    /// on first use.
    pub async fn call(
        &self,
        module: &str,
        class: Option<&str>,
        func: &str,
        args: Vec<Value>,
        kwargs: Vec<(Value, Value)>,
    ) -> std::result::Result<Value, CallError> {
        self.ensure_loaded(module).await.map_err(|e| CallError::new(e.to_string()))?;

        let lua = self.lua.lock().expect("poisoned");
        let exports: Table = loaded_table(&lua, module).map_err(mlua_call_error)?;
        let target = match class {
            Some(name) => exports.get::<Table>(name).map_err(|_| {
                CallError::new(format!("ImportError: no such class {module}.{name}"))
            })?,
            None => exports,
        };
        let f: LuaFunction = target.get(func).map_err(|_| {
            CallError::new(format!(
                "ImportError: no such function {module}{}.{func}",
                class.map(|c| format!(".{c}")).unwrap_or_default()
            ))
        })?;

        let mut lua_args = Vec::with_capacity(args.len());
        for arg in args {
            lua_args.push(value_to_lua(&lua, arg).map_err(mlua_call_error)?);
        }
        if !kwargs.is_empty() {
            let table = lua.create_table().map_err(mlua_call_error)?;
            for (k, v) in kwargs {
                let key = value_to_lua(&lua, k).map_err(mlua_call_error)?;
                let value = value_to_lua(&lua, v).map_err(mlua_call_error)?;
                table.set(key, value).map_err(mlua_call_error)?;
            }
            lua_args.push(LuaValue::Table(table));
        }

        let result = f.call::<LuaValue>(lua_args).map_err(|e| CallError::new(describe_lua_error(&e)))?;
        lua_to_value(result)
    }

    async fn ensure_loaded(&self, fullname: &str) -> Result<()> {
        if module_is_loaded(&self.lua.lock().expect("poisoned"), fullname).map_err(lua_to_import_error)? {
            return Ok(());
        }

        let chain = self.importer.import_chain(fullname).await?;
        let lua = self.lua.lock().expect("poisoned");
        for (name, info) in chain {
            if module_is_loaded(&lua, &name).map_err(lua_to_import_error)? {
                continue;
            }

            let mut source = Vec::new();
            flate2::read::ZlibDecoder::new(&info.compressed_source[..])
                .read_to_end(&mut source)
                .map_err(|e| Error::Import(format!("{name}: decompressing module source: {e}")))?;
            let source = String::from_utf8(source).map_err(|e| Error::Import(format!("{name}: non-utf8 source: {e}")))?;

            let exports: LuaValue = lua
                .load(&source)
                .set_name(&name)
                .eval()
                .map_err(|e| Error::Import(format!("{name}: {}", describe_lua_error(&e))))?;

            let package: Table = lua.globals().get("package").map_err(lua_to_import_error)?;
            let loaded: Table = package.get("loaded").map_err(lua_to_import_error)?;
            loaded.set(name, exports).map_err(lua_to_import_error)?;
        }
        Ok(())
    }
}

fn module_is_loaded(lua: &Lua, fullname: &str) -> mlua::Result<bool> {
    let package: Table = lua.globals().get("package")?;
    let loaded: Table = package.get("loaded")?;
    let entry: LuaValue = loaded.get(fullname)?;
    Ok(!matches!(entry, LuaValue::Nil))
}

fn loaded_table(lua: &Lua, fullname: &str) -> mlua::Result<Table> {
    let package: Table = lua.globals().get("package")?;
    let loaded: Table = package.get("loaded")?;
    loaded.get(fullname)
}

fn describe_lua_error(e: &mlua::Error) -> String {
    e.to_string()
}

fn mlua_call_error(e: mlua::Error) -> CallError {
    CallError::new(describe_lua_error(&e))
}

fn lua_to_import_error(e: mlua::Error) -> Error {
    Error::Import(describe_lua_error(&e))
}

fn value_to_lua(lua: &Lua, value: Value) -> mlua::Result<LuaValue> {
    Ok(match value {
        Value::Null => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(b),
        Value::Int(i) => LuaValue::Integer(i),
        Value::Float(f) => LuaValue::Number(f),
        Value::Bytes(b) => LuaValue::String(lua.create_string(&b)?),
        Value::Text(s) => LuaValue::String(lua.create_string(&s)?),
        Value::List(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.into_iter().enumerate() {
                table.set(i + 1, value_to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Map(pairs) => {
            let table = lua.create_table()?;
            for (k, v) in pairs {
                table.set(value_to_lua(lua, k)?, value_to_lua(lua, v)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Set(_) | Value::Context(_) | Value::Dead | Value::CallError(_) => {
            return Err(mlua::Error::RuntimeError(
                "unsupported call argument: Set/Context/Dead/CallError cannot cross into Lua".to_string(),
            ));
        }
    })
}

fn lua_to_value(value: LuaValue) -> std::result::Result<Value, CallError> {
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Boolean(b) => Ok(Value::Bool(b)),
        LuaValue::Integer(i) => Ok(Value::Int(i)),
        LuaValue::Number(n) => Ok(Value::Float(n)),
        LuaValue::String(s) => {
            let bytes = s.as_bytes().to_vec();
            match String::from_utf8(bytes.clone()) {
                Ok(text) => Ok(Value::Text(text)),
                Err(_) => Ok(Value::Bytes(bytes)),
            }
        }
        LuaValue::Table(t) => lua_table_to_value(&t),
        other => Err(CallError::new(format!("unsupported Lua return type: {}", other.type_name()))),
    }
}

/// A table is returned as a `List` when its keys are exactly `1..=len`
/// (a Lua "array"), and as a `Map` otherwise.
fn lua_table_to_value(table: &Table) -> std::result::Result<Value, CallError> {
    let len = table.raw_len();
    let mut pairs = Vec::new();
    let mut is_array = true;
    for pair in table.pairs::<LuaValue, LuaValue>() {
        let (k, v) = pair.map_err(|e| CallError::new(e.to_string()))?;
        if !matches!(&k, LuaValue::Integer(i) if *i >= 1 && (*i as usize) <= len) {
            is_array = false;
        }
        pairs.push((k, v));
    }

    if is_array && pairs.len() == len {
        let mut items: Vec<Option<Value>> = (0..len).map(|_| None).collect();
        for (k, v) in pairs {
            let LuaValue::Integer(i) = k else { unreachable!() };
            items[i as usize - 1] = Some(lua_to_value(v)?);
        }
        Ok(Value::List(items.into_iter().map(|v| v.unwrap_or(Value::Null)).collect()))
    } else {
        let mut out = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            out.push((lua_to_value(k)?, lua_to_value(v)?));
        }
        Ok(Value::Map(out))
    }
}
