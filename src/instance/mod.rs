//! Decoder instance (spec §4.4): one running decoder, its options, channel
//! map, pin history, output ports, and the stack it participates in.

pub mod exec_v1;
pub mod worker;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use mlua::{Table as LuaTable, Value as LuaValue, Variadic};

use crate::decoder::{ApiVersion, Decoder};
use crate::error::{Error, Result};
use crate::value::Value;
use crate::vm::Vm;

pub type InstanceId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    Annotation,
    Protocol,
    Binary,
    Meta,
}

impl OutputType {
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "annotation" => OutputType::Annotation,
            "protocol" => OutputType::Protocol,
            "binary" => OutputType::Binary,
            "meta" => OutputType::Meta,
            other => return Err(Error::arg(format!("unknown output type {other:?}"))),
        })
    }
}

/// One declared output stream (`add_output` at startup). Ids are dense and
/// never reused.
#[derive(Debug, Clone)]
pub struct OutputPort {
    pub id: usize,
    pub output_type: OutputType,
    pub protocol_id: String,
}

/// One `put()` call captured from the VM side, queued in the instance's
/// outbox for the session-level router (C5) to drain after each VM entry.
#[derive(Clone)]
pub struct PutCall {
    pub start: u64,
    pub end: u64,
    pub output_id: usize,
    pub payload: LuaValue,
}

// `Arc<Mutex<_>>`, not `Rc<RefCell<_>>`: under API v2 these are touched from
// the instance's worker thread (inside `put`/`register` callbacks) and
// drained from the caller's thread, so they must be `Send`.
pub(crate) type Outbox = Arc<Mutex<VecDeque<PutCall>>>;
pub(crate) type Ports = Arc<Mutex<Vec<OutputPort>>>;

/// Lifecycle state of an API-v2 instance's cooperative task (spec §4.4.2).
pub enum ExecState {
    /// API v1: no suspension, purely call-driven.
    PushModel,
    /// API v2, not yet started.
    Fresh,
    /// API v2, running: owns the worker.
    Running(worker::Worker),
    Terminated,
}

pub struct Instance {
    pub inst_id: String,
    pub decoder: Arc<Decoder>,
    pub option_values: HashMap<String, Value>,
    /// Index = decoder-declared channel order; value = host channel index,
    /// or `-1` if unwired (optional channel).
    pub channel_map: Vec<i32>,
    pub data_num_channels: u64,
    pub data_unitsize: u64,
    pub data_samplerate: u64,
    pub pin_history: Vec<u8>,
    pub output_ports: Ports,
    pub parent: Option<InstanceId>,
    pub children: Vec<InstanceId>,
    pub vm_object: LuaTable,
    pub exec: ExecState,
    pub abs_cur_samplenum: u64,
    pub(crate) outbox: Outbox,
}

impl Instance {
    pub fn new(vm: &Vm, decoder: Arc<Decoder>, inst_id: String) -> Result<Self> {
        let vm_object = vm.instantiate(&decoder.class_table)?;
        let num_channels = decoder.num_channels();
        let outbox: Outbox = Arc::new(Mutex::new(VecDeque::new()));
        let output_ports: Ports = Arc::new(Mutex::new(Vec::new()));

        let mut option_values = HashMap::new();
        for opt in &decoder.options {
            option_values.insert(opt.id.clone(), opt.default.clone());
        }

        bind_natives(vm, &vm_object, outbox.clone(), output_ports.clone())?;

        let exec = match decoder.api_version {
            ApiVersion::V1 => ExecState::PushModel,
            ApiVersion::V2 => ExecState::Fresh,
        };

        Ok(Instance {
            inst_id,
            decoder,
            option_values,
            channel_map: vec![-1; num_channels],
            data_num_channels: 0,
            data_unitsize: 0,
            data_samplerate: 0,
            pin_history: vec![0; num_channels],
            output_ports,
            parent: None,
            children: Vec::new(),
            vm_object,
            exec,
            abs_cur_samplenum: 0,
            outbox,
        })
    }

    /// `option_set`: typed overrides. Unknown keys warn; mistyped values are
    /// fatal (§4.4).
    pub fn option_set(&mut self, overrides: HashMap<String, Value>) -> Result<()> {
        for (key, value) in overrides {
            match self.decoder.options.iter().find(|o| o.id == key) {
                None => {
                    tracing::warn!(instance = %self.inst_id, option = %key, "unknown option, ignoring");
                }
                Some(desc) => {
                    if !desc.default.same_type(&value) {
                        return Err(Error::arg(format!(
                            "option {key} expects a {}, got a {}",
                            desc.default.type_name(),
                            value.type_name()
                        )));
                    }
                    if let Some(allowed) = &desc.values {
                        if !allowed.contains(&value) {
                            return Err(Error::arg(format!(
                                "option {key} value not in the declared enumeration"
                            )));
                        }
                    }
                    self.option_values.insert(key, value);
                }
            }
        }
        Ok(())
    }

    /// `channel_set_all`: replace the entire map; every required channel
    /// must be named.
    pub fn channel_set_all(&mut self, map: &HashMap<String, i64>) -> Result<()> {
        for ch in &self.decoder.channels {
            let host = map
                .get(&ch.id)
                .ok_or_else(|| Error::arg(format!("required channel {} not bound", ch.id)))?;
            self.channel_map[ch.index] = *host as i32;
        }
        for ch in &self.decoder.optional_channels {
            if let Some(host) = map.get(&ch.id) {
                self.channel_map[ch.index] = *host as i32;
            }
        }
        Ok(())
    }

    fn initial_pin_history(&self) -> Vec<u8> {
        let mut pins = vec![0u8; self.decoder.num_channels()];
        for &(index, value) in &self.decoder.initial_pins {
            if let Some(slot) = pins.get_mut(index) {
                *slot = value;
            }
        }
        pins
    }

    /// `start(inst)`: validate required channels are bound, build the
    /// default pin history, invoke the decoder's `start` entrypoint.
    pub fn start(&mut self, vm: &Vm, num_channels: u64, unitsize: u64, samplerate: u64) -> Result<()> {
        for ch in &self.decoder.channels {
            if self.channel_map[ch.index] < 0 {
                return Err(Error::arg(format!(
                    "required channel {} is not bound to a host channel",
                    ch.id
                )));
            }
        }
        self.data_num_channels = num_channels;
        self.data_unitsize = unitsize;
        self.data_samplerate = samplerate;
        self.pin_history = self.initial_pin_history();
        self.abs_cur_samplenum = 0;

        {
            let lua = vm.lock();
            let options_table = lua.create_table()?;
            for (k, v) in &self.option_values {
                options_table.set(k.as_str(), v.to_lua(&lua)?)?;
            }
            self.vm_object.set("options", options_table)?;
            self.vm_object.set("samplenum", 0i64)?;
        }

        vm.call_method(&self.vm_object, "start", Variadic::new())?;
        Ok(())
    }

    /// `terminate_reset`: ask the decoder to flush, drop the execution
    /// context. No `put` may be observed after this point (spec §9 open
    /// question, resolved toward the stricter contract).
    pub fn terminate_reset(&mut self, vm: &Vm) -> Result<()> {
        {
            let _guard = vm.lock();
            if let Ok(flush) = self.vm_object.get::<_, mlua::Function>("flush") {
                let _ = flush.call::<_, ()>(self.vm_object.clone());
            }
        }
        if let ExecState::Running(worker) = std::mem::replace(&mut self.exec, ExecState::Terminated) {
            worker.terminate();
        }
        Ok(())
    }

    pub fn drain_outbox(&self) -> Vec<PutCall> {
        self.outbox.lock().unwrap().drain(..).collect()
    }

    /// Run one chunk through an API-v2 instance: start its worker on first
    /// use, hand it the buffer, block until handled, then drain whatever it
    /// `put()` while processing.
    pub fn run_chunk_v2(
        &mut self,
        vm: &Vm,
        buf: Arc<[u8]>,
        start_samplenum: u64,
        end_samplenum: u64,
    ) -> Result<Vec<PutCall>> {
        worker::start_root(vm, self)?;
        match &self.exec {
            ExecState::Running(w) => w.feed_chunk(buf, start_samplenum, end_samplenum)?,
            _ => return Err(Error::generic("instance has no running v2 worker")),
        }
        self.abs_cur_samplenum = end_samplenum;
        Ok(self.drain_outbox())
    }
}

/// Bind `self:register(...)` and `self:put(...)` once, for the lifetime of
/// the instance. Both operate on reference-counted, owned state (not
/// borrows), so the closures are `'static` and need no `Lua::scope` games.
fn bind_natives(vm: &Vm, vm_object: &LuaTable, outbox: Outbox, ports: Ports) -> Result<()> {
    let lua = vm.lock();

    let register_ports = ports.clone();
    let register = lua.create_function(
        move |_, (_self_tbl, output_type, protocol_id): (LuaTable, String, Option<String>)| {
            let output_type = OutputType::from_str(&output_type).map_err(mlua::Error::external)?;
            let mut ports = register_ports.lock().unwrap();
            let id = ports.len();
            ports.push(OutputPort {
                id,
                output_type,
                protocol_id: protocol_id.unwrap_or_default(),
            });
            Ok(id)
        },
    )?;
    vm_object.set("register", register)?;

    let put_outbox = outbox;
    let put = lua.create_function(
        move |_, (_self_tbl, start, end, output_id, payload): (LuaTable, u64, u64, usize, LuaValue)| {
            put_outbox.lock().unwrap().push_back(PutCall {
                start,
                end,
                output_id,
                payload,
            });
            Ok(())
        },
    )?;
    vm_object.set("put", put)?;

    Ok(())
}
