//! API v2 execution (pull model, spec §4.4.2, §5): one cooperative task per
//! stacked root, coordinated with the caller via a mutex and two condition
//! variables (`new_samples_available`, `chunk_handled`).
//!
//! `wait(conds)` itself is implemented as a small Lua-level loop
//! (`PRELUDE` below) around two native polls, `__wait_begin`/`__wait_poll`:
//! a native Rust callback cannot call `coroutine.yield` on the script's
//! behalf (Lua forbids yielding across a C-call boundary), so the yield has
//! to happen in Lua bytecode directly. The native polls do the actual,
//! non-blocking work: advancing the condition engine (§4.3) over whatever
//! of the current chunk remains.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use mlua::{Table as LuaTable, Thread as LuaThread, ThreadStatus, Value as LuaValue};

use crate::condition::ConditionList;
use crate::error::{Error, Result};
use crate::vm::Vm;

use super::{ExecState, Instance};

/// Lua source defining the `wait` wrapper shared by every API-v2 instance.
pub const PRELUDE: &str = r#"
function __sigdecode_wait(self, conds)
  self:__wait_begin(conds)
  while true do
    local matched, pins, samplenum = self:__wait_poll()
    if matched then
      return matched, pins, samplenum
    end
    coroutine.yield()
  end
end
"#;

struct SharedState {
    pending_chunk: Option<(Arc<[u8]>, u64, u64)>,
    pending_conditions: Option<ConditionList>,
    cur_samplenum: u64,
    pin_history: Vec<u8>,
    channel_map: Vec<i32>,
    unitsize: usize,
    handled: bool,
    terminated: bool,
    error: Option<Error>,
}

struct Gate {
    state: Mutex<SharedState>,
    new_samples: Condvar,
    chunk_handled: Condvar,
}

/// The per-root cooperative task plus its handshake (spec §3's "execution
/// context", §5's thread-plus-condvars).
pub struct Worker {
    gate: Arc<Gate>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(vm: Vm, thread: LuaThread, gate: Arc<Gate>) -> Worker {
        let worker_gate = gate.clone();
        let handle = std::thread::spawn(move || worker_loop(vm, thread, worker_gate));
        Worker {
            gate,
            handle: Some(handle),
        }
    }

    /// Publish a new chunk and block until the worker has consumed it
    /// (either by exhausting it with no match, or by suspending on a fresh
    /// `wait` after matching somewhere inside it).
    pub fn feed_chunk(&self, buf: Arc<[u8]>, start: u64, end: u64) -> Result<()> {
        {
            let mut st = self.gate.state.lock().unwrap();
            if st.terminated {
                return Err(Error::generic("decoder task has already terminated"));
            }
            st.pending_chunk = Some((buf, start, end));
            st.handled = false;
        }
        self.gate.new_samples.notify_all();

        let mut st = self.gate.state.lock().unwrap();
        while !st.handled && !st.terminated {
            st = self.gate.chunk_handled.wait(st).unwrap();
        }
        if let Some(err) = st.error.take() {
            return Err(err);
        }
        Ok(())
    }

    pub fn terminate(mut self) {
        {
            let mut st = self.gate.state.lock().unwrap();
            st.terminated = true;
        }
        self.gate.new_samples.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(vm: Vm, thread: LuaThread, gate: Arc<Gate>) {
    loop {
        {
            let mut st = gate.state.lock().unwrap();
            while st.pending_chunk.is_none() && !st.terminated {
                st = gate.new_samples.wait(st).unwrap();
            }
            if st.terminated {
                return;
            }
        }

        let result = {
            let _guard = vm.lock();
            thread.resume::<_, mlua::MultiValue>(())
        };

        let mut st = gate.state.lock().unwrap();
        st.pending_chunk = None;
        match result {
            Ok(_) => {
                if thread.status() != ThreadStatus::Resumable {
                    st.terminated = true;
                }
            }
            Err(e) => {
                st.error = Some(e.into());
                st.terminated = true;
            }
        }
        st.handled = true;
        let terminated = st.terminated;
        drop(st);
        gate.chunk_handled.notify_all();
        if terminated {
            return;
        }
    }
}

/// Bind `self.__wait_begin`, `self.__wait_poll`, and `self.wait` on a
/// fresh API-v2 instance table. Called once, before the root's worker is
/// spawned.
fn bind_wait(vm: &Vm, vm_object: &LuaTable, gate: Arc<Gate>) -> Result<()> {
    let lua = vm.lock();

    let begin_gate = gate.clone();
    let wait_begin = lua.create_function(move |_, (_self_tbl, conds): (LuaTable, LuaValue)| {
        let list = ConditionList::from_lua(&conds).map_err(mlua::Error::external)?;
        begin_gate.state.lock().unwrap().pending_conditions = Some(list);
        Ok(())
    })?;
    vm_object.set("__wait_begin", wait_begin)?;

    let poll_gate = gate.clone();
    let wait_poll = lua.create_function(move |lua, self_tbl: LuaTable| {
        let mut st = poll_gate.state.lock().unwrap();
        let (buf, buf_start, end) = match st.pending_chunk.clone() {
            Some(c) => c,
            None => return Ok((false, LuaValue::Nil, 0i64)),
        };
        let mut conditions = st
            .pending_conditions
            .take()
            .ok_or_else(|| mlua::Error::RuntimeError("wait() polled without begin".into()))?;
        let mut cur = st.cur_samplenum;
        let mut pins = st.pin_history.clone();
        let channel_map = st.channel_map.clone();
        let unitsize = st.unitsize;

        let outcome = crate::condition::run(
            &mut conditions,
            &buf,
            buf_start,
            unitsize,
            &channel_map,
            &mut pins,
            &mut cur,
            end,
        );
        st.cur_samplenum = cur;
        st.pin_history = pins.clone();

        match outcome {
            Some(o) => {
                drop(st);
                let pins_table = lua.create_table()?;
                for (i, b) in pins.iter().enumerate() {
                    pins_table.set(i + 1, *b)?;
                }
                let match_table = if o.match_array.is_empty() {
                    LuaValue::Nil
                } else {
                    let t = lua.create_table()?;
                    for (i, m) in o.match_array.iter().enumerate() {
                        t.set(i + 1, *m)?;
                    }
                    LuaValue::Table(t)
                };
                self_tbl.set("matched", match_table)?;
                self_tbl.set("samplenum", o.matched_samplenum as i64)?;
                Ok((true, LuaValue::Table(pins_table), o.matched_samplenum as i64))
            }
            None => {
                st.pending_conditions = Some(conditions);
                Ok((false, LuaValue::Nil, 0i64))
            }
        }
    })?;
    vm_object.set("__wait_poll", wait_poll)?;

    let prelude_fn: mlua::Function = lua.globals().get("__sigdecode_wait")?;
    vm_object.set("wait", prelude_fn)?;

    Ok(())
}

/// Transition an API-v2 instance from `Fresh` to `Running`: bind the wait
/// natives, wrap `decode(self)` in a coroutine, and spawn its worker
/// thread. A no-op if the instance is already running.
pub fn start_root(vm: &Vm, inst: &mut Instance) -> Result<()> {
    if !matches!(inst.exec, ExecState::Fresh) {
        return Ok(());
    }

    let gate = Arc::new(Gate {
        state: Mutex::new(SharedState {
            pending_chunk: None,
            pending_conditions: None,
            cur_samplenum: inst.abs_cur_samplenum,
            pin_history: inst.pin_history.clone(),
            channel_map: inst.channel_map.clone(),
            unitsize: inst.data_unitsize as usize,
            handled: true,
            terminated: false,
            error: None,
        }),
        new_samples: Condvar::new(),
        chunk_handled: Condvar::new(),
    });
    bind_wait(vm, &inst.vm_object, gate.clone())?;

    let thread = {
        let lua = vm.lock();
        let decode_method: mlua::Function = inst.vm_object.get("decode")?;
        let vm_object = inst.vm_object.clone();
        let starter =
            lua.create_function(move |_, ()| decode_method.call::<_, ()>(vm_object.clone()))?;
        lua.create_thread(starter)?
    };

    inst.exec = ExecState::Running(Worker::spawn(vm.clone(), thread, gate));
    Ok(())
}
