use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use mlua::{Lua, Table, Value as LuaValue, Variadic};

use crate::error::{Error, Result};

/// The embedded scripting VM, guarded by one process-wide lock (spec §4.7,
/// §5: "all VM calls are serialized by the global lock").
///
/// Cloning a `Vm` clones the `Arc`, not the interpreter: every clone shares
/// one Lua state, matching the single-VM-per-process model the spec
/// describes.
#[derive(Clone)]
pub struct Vm {
    inner: Arc<Mutex<Lua>>,
}

impl Vm {
    pub fn new() -> Self {
        let lua = Lua::new();
        lua.load(crate::instance::worker::PRELUDE)
            .set_name("<sigdecode wait prelude>")
            .exec()
            .expect("built-in wait() prelude failed to load");
        Vm {
            inner: Arc::new(Mutex::new(lua)),
        }
    }

    /// Acquire the global lock. Every public entry point that touches the
    /// VM goes through this, and the guard is dropped on every exit path
    /// (including early returns via `?`) because it's an ordinary RAII
    /// guard.
    pub fn lock(&self) -> MutexGuard<'_, Lua> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Prepend `path` to the VM's module search list (`searchpath_add`).
    pub fn searchpath_add(&self, path: &Path) -> Result<()> {
        let lua = self.lock();
        let package: Table = lua.globals().get("package")?;
        let current: String = package.get("path")?;
        let pattern = format!(
            "{dir}/?.lua;{dir}/?/decoder.lua;{existing}",
            dir = path.display(),
            existing = current
        );
        package.set("path", pattern)?;
        Ok(())
    }

    /// Load a module by name: search the given directories (in order, most
    /// recently added first) for `<dir>/<name>.lua` or
    /// `<dir>/<name>/decoder.lua`, evaluate it, and return the table it
    /// returns (the standard Lua module idiom: `local M = {}; ...; return M`).
    pub fn load_module(&self, search_paths: &[PathBuf], name: &str) -> Result<Table> {
        let lua = self.lock();
        let mut last_err = None;
        for dir in search_paths {
            for candidate in [
                dir.join(format!("{name}.lua")),
                dir.join(name).join("decoder.lua"),
            ] {
                match std::fs::read_to_string(&candidate) {
                    Ok(src) => {
                        let chunk = lua.load(&src).set_name(&candidate.to_string_lossy().into_owned());
                        let value: LuaValue = chunk.eval()?;
                        return match value {
                            LuaValue::Table(t) => Ok(t),
                            other => Err(Error::arg(format!(
                                "module {name} did not return a table (got {})",
                                other.type_name()
                            ))),
                        };
                    }
                    Err(e) => last_err = Some(e),
                }
            }
        }
        Err(Error::SearchPathError {
            path: name.to_string(),
            source: last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no search paths configured")
            }),
        })
    }

    /// Invoke a method on a VM-side object (`obj:name(args...)` in Lua
    /// terms), returning whatever it returns as a `Variadic<LuaValue>`.
    /// VM exceptions are captured and translated here — the one place
    /// foreign exceptions cross into the runtime's `Error` taxonomy.
    pub fn call_method(
        &self,
        obj: &Table,
        name: &str,
        args: Variadic<LuaValue>,
    ) -> Result<Variadic<LuaValue>> {
        let _guard = self.lock();
        let func: mlua::Function = obj.get(name)?;
        let mut full_args: Vec<LuaValue> = Vec::with_capacity(args.len() + 1);
        full_args.push(LuaValue::Table(obj.clone()));
        full_args.extend(args.into_iter());
        let result: Variadic<LuaValue> = func.call(Variadic::from_iter(full_args))?;
        Ok(result)
    }

    /// Create a fresh instance table sharing the class table's methods via
    /// `__index`, the Lua analogue of instantiating a Python class.
    pub fn instantiate(&self, class: &Table) -> Result<Table> {
        let lua = self.lock();
        let instance = lua.create_table()?;
        let meta = lua.create_table()?;
        meta.set("__index", class.clone())?;
        instance.set_metatable(Some(meta));
        Ok(instance)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_module_reads_lua_file_and_returns_table() {
        let dir = std::env::temp_dir().join(format!("sigdecode-vm-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dummy.lua");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "return {{ id = 'dummy' }}").unwrap();

        let vm = Vm::new();
        let table = vm.load_module(&[dir.clone()], "dummy").unwrap();
        let id: String = table.get("id").unwrap();
        assert_eq!(id, "dummy");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_module_missing_is_search_path_error() {
        let vm = Vm::new();
        let err = vm.load_module(&[], "does-not-exist").unwrap_err();
        matches!(err, Error::SearchPathError { .. });
    }

    #[test]
    fn instantiate_shares_class_methods() {
        let vm = Vm::new();
        let lua = vm.lock();
        let class = lua.create_table().unwrap();
        class
            .set(
                "greet",
                lua.create_function(|_, _: Table| Ok("hi".to_string())).unwrap(),
            )
            .unwrap();
        drop(lua);
        let inst = vm.instantiate(&class).unwrap();
        let result = vm
            .call_method(&inst, "greet", Variadic::new())
            .unwrap();
        assert_eq!(result.len(), 1);
    }
}
