//! Runtime: the single value that owns what the source kept as module
//! globals — search paths, the decoder registry, and the set of live
//! sessions (spec §9, "replacing global mutable state"). One `Runtime`
//! implies one VM, so the single-VM-lock invariant in §4.7/§5 is explicit
//! in the type rather than relying on callers to share a global by
//! convention.

use std::path::PathBuf;
use std::sync::Arc;

use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::session::Session;
use crate::vm::Vm;

pub type SessionId = usize;

pub struct Runtime {
    vm: Vm,
    search_paths: Vec<PathBuf>,
    registry: Registry,
    sessions: Vec<Option<Session>>,
}

impl Runtime {
    /// Seeds the search path from `DECODER_SEARCH_DIR` (`:`-separated, like
    /// `PATH`) if set, falling back to a platform-default decoders
    /// directory under the user's data dir (the teacher resolves its own
    /// config directory the same way, via `dirs`, in `storage.rs`).
    pub fn new() -> Self {
        let mut search_paths = Vec::new();
        match std::env::var_os("DECODER_SEARCH_DIR") {
            Some(val) => search_paths.extend(std::env::split_paths(&val)),
            None => {
                if let Some(dir) = dirs::data_dir() {
                    search_paths.push(dir.join("sigdecode").join("decoders"));
                }
            }
        }
        Runtime {
            vm: Vm::new(),
            search_paths,
            registry: Registry::new(),
            sessions: Vec::new(),
        }
    }

    /// `searchpath_add(path)`: prepend to the search list, most-recently
    /// added first (§4.1).
    pub fn searchpath_add(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.insert(0, path.into());
    }

    /// `decoder_load(module_name)`.
    pub fn decoder_load(&mut self, module_name: &str) -> Result<Arc<Decoder>> {
        self.registry.load(&self.vm, &self.search_paths, module_name)
    }

    /// `decoder_list()`.
    pub fn decoder_list(&self) -> &[Arc<Decoder>] {
        self.registry.list()
    }

    /// `decoder_get(id)`.
    pub fn decoder_get(&self, id: &str) -> Option<Arc<Decoder>> {
        self.registry.get(id)
    }

    /// `decoder_unload(dec)`: tear down every session that references it
    /// first (instances anywhere in a stack graph may hold it, and
    /// selective eviction of just those instances is fragile), then drop
    /// the registry entry.
    pub fn decoder_unload(&mut self, id: &str) -> Result<()> {
        for slot in self.sessions.iter_mut() {
            let references = slot.as_ref().map(|s| s.uses_decoder(id)).unwrap_or(false);
            if references {
                if let Some(mut session) = slot.take() {
                    session.destroy()?;
                }
            }
        }
        self.registry.remove(id);
        Ok(())
    }

    /// `session_new`: allocate a session owned by this runtime's VM.
    pub fn session_new(&mut self) -> SessionId {
        let id = self.sessions.len();
        self.sessions.push(Some(Session::new(id, self.vm.clone())));
        id
    }

    pub fn session(&self, id: SessionId) -> Result<&Session> {
        self.sessions
            .get(id)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| Error::arg("unknown or destroyed session id"))
    }

    pub fn session_mut(&mut self, id: SessionId) -> Result<&mut Session> {
        self.sessions
            .get_mut(id)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| Error::arg("unknown or destroyed session id"))
    }

    /// `session_destroy`. A session must not be destroyed while a `decode`
    /// call is on the call stack (§3); since every public entry point here
    /// is synchronous and re-entrant calls aren't exposed, that invariant
    /// holds by construction — there is no API surface to violate it from.
    pub fn session_destroy(&mut self, id: SessionId) -> Result<()> {
        if let Some(slot) = self.sessions.get_mut(id) {
            if let Some(mut session) = slot.take() {
                session.destroy()?;
            }
        }
        Ok(())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_decoder(dir: &std::path::Path, name: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let mut f = std::fs::File::create(dir.join(format!("{name}.lua"))).unwrap();
        write!(
            f,
            r#"
            local M = {{}}
            M.id = '{name}'
            M.api_version = 1
            M.channels = {{ {{ id = 'a', name = 'A', desc = '' }} }}
            function M.start(self) end
            function M.decode(self, ss, es, data) end
            return M
            "#
        )
        .unwrap();
    }

    #[test]
    fn load_then_unload_tears_down_referencing_sessions() {
        let dir = std::env::temp_dir().join(format!("sigdecode-runtime-test-{}", std::process::id()));
        write_decoder(&dir, "udec");

        let mut rt = Runtime::new();
        rt.searchpath_add(dir.clone());
        let dec = rt.decoder_load("udec").unwrap();

        let sid = rt.session_new();
        {
            let session = rt.session_mut(sid).unwrap();
            session.instance_new(dec, None).unwrap();
        }

        rt.decoder_unload("udec").unwrap();
        assert!(rt.decoder_get("udec").is_none());
        assert!(rt.session(sid).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn session_new_allocates_distinct_ids() {
        let mut rt = Runtime::new();
        let a = rt.session_new();
        let b = rt.session_new();
        assert_ne!(a, b);
        assert!(rt.session(a).is_ok());
        assert!(rt.session(b).is_ok());
    }
}
