//! Session (C6) and output router (C5): a set of instance roots plus host
//! callbacks, driven through start/feed/terminate (spec §4.5, §4.6).

use std::collections::HashMap;
use std::sync::Arc;

use mlua::{Table as LuaTable, Value as LuaValue, Variadic};

use crate::decoder::{ApiVersion, Decoder};
use crate::error::{Error, Result};
use crate::instance::{exec_v1, Instance, InstanceId, OutputType};
use crate::value::Value;
use crate::vm::Vm;

pub type AnnotationCallback = Box<dyn FnMut(&str, u64, u64, usize, &[String]) + Send>;
pub type BinaryCallback = Box<dyn FnMut(&str, u64, u64, usize, &[u8]) + Send>;
pub type MetadataCallback = Box<dyn FnMut(&str, &Value) + Send>;

/// A session: instance arena, roots, callback table, acquisition metadata.
/// Instances are addressed by dense `InstanceId` handles into `instances`
/// (the "replace refcounted graph edges with an arena" design note); a
/// freed slot becomes `None` and its id is never reused.
pub struct Session {
    pub session_id: usize,
    vm: Vm,
    instances: Vec<Option<Instance>>,
    roots: Vec<InstanceId>,
    num_channels: Option<u64>,
    unitsize: Option<u64>,
    samplerate: Option<u64>,
    metadata: HashMap<String, Value>,
    next_expected_samplenum: Option<u64>,
    started: bool,
    on_annotation: Option<AnnotationCallback>,
    on_binary: Option<BinaryCallback>,
    on_metadata: Option<MetadataCallback>,
}

impl Session {
    pub fn new(session_id: usize, vm: Vm) -> Self {
        Session {
            session_id,
            vm,
            instances: Vec::new(),
            roots: Vec::new(),
            num_channels: None,
            unitsize: None,
            samplerate: None,
            metadata: HashMap::new(),
            next_expected_samplenum: None,
            started: false,
            on_annotation: None,
            on_binary: None,
            on_metadata: None,
        }
    }

    pub fn set_on_annotation(&mut self, cb: AnnotationCallback) {
        self.on_annotation = Some(cb);
    }

    pub fn set_on_binary(&mut self, cb: BinaryCallback) {
        self.on_binary = Some(cb);
    }

    pub fn set_on_metadata(&mut self, cb: MetadataCallback) {
        self.on_metadata = Some(cb);
    }

    /// `config_set(key, value)`: `NUM_CHANNELS`, `UNITSIZE`, `SAMPLERATE`.
    pub fn config_set(&mut self, key: &str, value: Value) -> Result<()> {
        let n = match value {
            Value::Int(n) if n >= 0 => n as u64,
            other => {
                return Err(Error::arg(format!(
                    "{key} must be a non-negative integer, got a {}",
                    other.type_name()
                )))
            }
        };
        match key {
            "NUM_CHANNELS" => self.num_channels = Some(n),
            "UNITSIZE" => self.unitsize = Some(n),
            "SAMPLERATE" => self.samplerate = Some(n),
            other => return Err(Error::arg(format!("unknown session config key {other:?}"))),
        }
        Ok(())
    }

    /// `config_get(key)` (invariant 7: round-trips whatever `config_set` last stored).
    pub fn config_get(&self, key: &str) -> Option<Value> {
        let n = match key {
            "NUM_CHANNELS" => self.num_channels,
            "UNITSIZE" => self.unitsize,
            "SAMPLERATE" => self.samplerate,
            _ => None,
        };
        n.map(|n| Value::Int(n as i64))
    }

    pub fn metadata_set(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// `instance_new`.
    pub fn instance_new(&mut self, decoder: Arc<Decoder>, inst_id: Option<String>) -> Result<InstanceId> {
        let id = self.instances.len();
        let inst_id = inst_id.unwrap_or_else(|| format!("{}-{}", decoder.id, id));
        let instance = Instance::new(&self.vm, decoder, inst_id)?;
        self.instances.push(Some(instance));
        self.roots.push(id);
        Ok(id)
    }

    /// Whether any live instance in this session was created from the
    /// decoder with the given id (used by `Runtime::decoder_unload`).
    pub fn uses_decoder(&self, id: &str) -> bool {
        self.instances
            .iter()
            .filter_map(|s| s.as_ref())
            .any(|inst| inst.decoder.id == id)
    }

    fn get(&self, id: InstanceId) -> Result<&Instance> {
        self.instances
            .get(id)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| Error::arg("unknown or freed instance id"))
    }

    /// `option_set`.
    pub fn option_set(&mut self, id: InstanceId, overrides: HashMap<String, Value>) -> Result<()> {
        self.instances
            .get_mut(id)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| Error::arg("unknown or freed instance id"))?
            .option_set(overrides)
    }

    /// `channel_set_all`.
    pub fn channel_set_all(&mut self, id: InstanceId, map: &HashMap<String, i64>) -> Result<()> {
        self.instances
            .get_mut(id)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| Error::arg("unknown or freed instance id"))?
            .channel_set_all(map)
    }

    /// `stack(parent, child)`: detach `child` from the roots (if present),
    /// append to `parent.children`. Rejects self-stacking and anything that
    /// would make `child` its own ancestor.
    pub fn stack(&mut self, parent: InstanceId, child: InstanceId) -> Result<()> {
        self.get(parent)?;
        self.get(child)?;
        if parent == child {
            return Err(Error::arg("cannot stack an instance onto itself"));
        }
        let mut cursor = Some(parent);
        while let Some(c) = cursor {
            if c == child {
                return Err(Error::arg("stacking would create a cycle"));
            }
            cursor = self.instances[c].as_ref().and_then(|i| i.parent);
        }

        self.roots.retain(|&r| r != child);
        if let Some(old_parent) = self.instances[child].as_ref().and_then(|i| i.parent) {
            if let Some(op) = self.instances.get_mut(old_parent).and_then(|s| s.as_mut()) {
                op.children.retain(|&c| c != child);
            }
        }
        self.instances[parent].as_mut().unwrap().children.push(child);
        self.instances[child].as_mut().unwrap().parent = Some(parent);
        Ok(())
    }

    /// `unstack(child)` (§F): detach from its parent and restore it as a
    /// session root.
    pub fn unstack(&mut self, child: InstanceId) -> Result<()> {
        self.get(child)?;
        let parent = self.instances[child].as_ref().and_then(|i| i.parent);
        if let Some(p) = parent {
            if let Some(pi) = self.instances.get_mut(p).and_then(|s| s.as_mut()) {
                pi.children.retain(|&c| c != child);
            }
        }
        self.instances[child].as_mut().unwrap().parent = None;
        if !self.roots.contains(&child) {
            self.roots.push(child);
        }
        Ok(())
    }

    /// `free(inst)`: recursively frees children first, then releases this
    /// instance's VM objects.
    pub fn instance_free(&mut self, id: InstanceId) -> Result<()> {
        let children = self
            .get(id)?
            .children
            .clone();
        for child in children {
            self.instance_free(child)?;
        }
        if let Some(mut inst) = self.instances.get_mut(id).and_then(|s| s.take()) {
            let _ = inst.terminate_reset(&self.vm);
            if let Some(p) = inst.parent {
                if let Some(pi) = self.instances.get_mut(p).and_then(|s| s.as_mut()) {
                    pi.children.retain(|&c| c != id);
                }
            }
        }
        self.roots.retain(|&r| r != id);
        Ok(())
    }

    /// `start`: require `NUM_CHANNELS/UNITSIZE/SAMPLERATE > 0`; start every
    /// root, recursively starting children underneath it.
    pub fn start(&mut self) -> Result<()> {
        let num_channels = self
            .num_channels
            .ok_or_else(|| Error::arg("NUM_CHANNELS is not configured"))?;
        let unitsize = self.unitsize.ok_or_else(|| Error::arg("UNITSIZE is not configured"))?;
        let samplerate = self
            .samplerate
            .ok_or_else(|| Error::arg("SAMPLERATE is not configured"))?;
        if num_channels == 0 || unitsize == 0 || samplerate == 0 {
            return Err(Error::arg("NUM_CHANNELS, UNITSIZE, and SAMPLERATE must all be > 0"));
        }
        // Every required channel must map to a value in [0, num_channels)
        // (invariant 2), and the sample view reads that value as a bit
        // index into a unitsize*8-bit-wide sample (§4.2). A NUM_CHANNELS
        // that doesn't fit in UNITSIZE bytes would let an otherwise-valid
        // channel map index past the sample's bit width, so reject the
        // contradiction here instead of panicking on first decode.
        if num_channels > unitsize * 8 {
            return Err(Error::arg(format!(
                "NUM_CHANNELS ({num_channels}) exceeds the {} bits UNITSIZE ({unitsize}) provides per sample",
                unitsize * 8
            )));
        }

        let metadata_table = {
            let lua = self.vm.lock();
            let t = lua.create_table()?;
            for (k, v) in &self.metadata {
                t.set(k.as_str(), v.to_lua(&lua)?)?;
            }
            t
        };

        let roots = self.roots.clone();
        for root in roots {
            self.start_recursive(root, num_channels, unitsize, samplerate, &metadata_table)?;
        }
        self.started = true;
        self.next_expected_samplenum = Some(0);
        Ok(())
    }

    fn start_recursive(
        &mut self,
        id: InstanceId,
        num_channels: u64,
        unitsize: u64,
        samplerate: u64,
        metadata_table: &LuaTable,
    ) -> Result<()> {
        let children = {
            let inst = self
                .instances
                .get_mut(id)
                .and_then(|s| s.as_mut())
                .ok_or_else(|| Error::generic("instance freed before start"))?;
            {
                let _guard = self.vm.lock();
                inst.vm_object.set("meta", metadata_table.clone())?;
            }
            inst.start(&self.vm, num_channels, unitsize, samplerate)?;
            inst.children.clone()
        };
        for child in children {
            self.start_recursive(child, num_channels, unitsize, samplerate, metadata_table)?;
        }
        Ok(())
    }

    /// `send(start_samplenum, buf, len)`.
    pub fn send(&mut self, start_samplenum: u64, buf: &[u8], len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let unitsize = self.unitsize.ok_or_else(|| Error::generic("session not started"))?;
        if unitsize == 0 || len % unitsize as usize != 0 {
            return Err(Error::arg("len is not a multiple of unitsize"));
        }
        if let Some(expected) = self.next_expected_samplenum {
            if start_samplenum != expected {
                return Err(Error::arg(format!(
                    "sample chunk is not contiguous: expected start {expected}, got {start_samplenum}"
                )));
            }
        }
        let n = len as u64 / unitsize;
        let end_samplenum = start_samplenum + n;
        self.next_expected_samplenum = Some(end_samplenum);

        let chunk: Arc<[u8]> = Arc::from(&buf[..len]);
        let roots = self.roots.clone();
        for root_id in roots {
            let calls = {
                let inst = self
                    .instances
                    .get_mut(root_id)
                    .and_then(|s| s.as_mut())
                    .ok_or_else(|| Error::generic("root instance freed mid-session"))?;
                match inst.decoder.api_version {
                    ApiVersion::V1 => {
                        exec_v1::run_chunk(&self.vm, inst, &chunk, start_samplenum, end_samplenum)?
                    }
                    ApiVersion::V2 => inst.run_chunk_v2(&self.vm, chunk.clone(), start_samplenum, end_samplenum)?,
                }
            };
            self.route(root_id, calls)?;
        }
        Ok(())
    }

    /// `terminate_reset`: recursively terminate every instance.
    pub fn terminate_reset(&mut self) -> Result<()> {
        for slot in self.instances.iter_mut() {
            if let Some(inst) = slot {
                inst.terminate_reset(&self.vm)?;
            }
        }
        Ok(())
    }

    /// `destroy`: recursively free, deregister callbacks.
    pub fn destroy(&mut self) -> Result<()> {
        self.terminate_reset()?;
        self.instances.clear();
        self.roots.clear();
        self.on_annotation = None;
        self.on_binary = None;
        self.on_metadata = None;
        Ok(())
    }

    /// C5: dispatch every `put()` call an instance produced while handling
    /// one chunk. Protocol objects recurse into every stacked child's
    /// `decode`, inline, on this same thread (spec §4.4.3, §5: "children
    /// within a stack run inline on the worker owning the root").
    fn route(&mut self, inst_id: InstanceId, calls: Vec<crate::instance::PutCall>) -> Result<()> {
        for call in calls {
            let port = {
                let inst = self.get(inst_id)?;
                inst.output_ports.lock().unwrap().get(call.output_id).cloned()
            };
            let port = match port {
                Some(p) => p,
                None => {
                    tracing::error!(instance = inst_id, output_id = call.output_id, "put() referenced an unregistered output id, dropping");
                    continue;
                }
            };
            match port.output_type {
                OutputType::Annotation => self.route_annotation(inst_id, &call)?,
                OutputType::Binary => self.route_binary(inst_id, &call)?,
                OutputType::Meta => self.route_meta(&call)?,
                OutputType::Protocol => {
                    self.dispatch_protocol_to_children(inst_id, call.start, call.end, call.payload)?
                }
            }
        }
        Ok(())
    }

    fn route_annotation(&mut self, inst_id: InstanceId, call: &crate::instance::PutCall) -> Result<()> {
        let parsed = {
            let _guard = self.vm.lock();
            parse_annotation_payload(&call.payload)
        };
        let (ann_index, strings) = match parsed {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(%e, "malformed annotation payload, dropping");
                return Ok(());
            }
        };
        let inst = self.get(inst_id)?;
        if ann_index >= inst.decoder.annotations.len() {
            tracing::error!(ann_index, "annotation class index out of range, dropping");
            return Ok(());
        }
        let inst_label = inst.inst_id.clone();
        if let Some(cb) = &mut self.on_annotation {
            cb(&inst_label, call.start, call.end, ann_index, &strings);
        }
        Ok(())
    }

    fn route_binary(&mut self, inst_id: InstanceId, call: &crate::instance::PutCall) -> Result<()> {
        let parsed = {
            let _guard = self.vm.lock();
            parse_binary_payload(&call.payload)
        };
        let (bin_index, bytes) = match parsed {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(%e, "malformed binary payload, dropping");
                return Ok(());
            }
        };
        let inst = self.get(inst_id)?;
        if bin_index >= inst.decoder.binary.len() {
            tracing::error!(bin_index, "binary class index out of range, dropping");
            return Ok(());
        }
        let inst_label = inst.inst_id.clone();
        if let Some(cb) = &mut self.on_binary {
            cb(&inst_label, call.start, call.end, bin_index, &bytes);
        }
        Ok(())
    }

    fn route_meta(&mut self, call: &crate::instance::PutCall) -> Result<()> {
        let parsed = {
            let _guard = self.vm.lock();
            parse_meta_payload(&call.payload)
        };
        let (key, value) = match parsed {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(%e, "malformed metadata payload, dropping");
                return Ok(());
            }
        };
        if let Some(cb) = &mut self.on_metadata {
            cb(&key, &value);
        }
        Ok(())
    }

    fn dispatch_protocol_to_children(
        &mut self,
        inst_id: InstanceId,
        start: u64,
        end: u64,
        payload: LuaValue,
    ) -> Result<()> {
        let children = self.get(inst_id)?.children.clone();
        for child_id in children {
            let child_calls = {
                let child = self
                    .instances
                    .get_mut(child_id)
                    .and_then(|s| s.as_mut())
                    .ok_or_else(|| Error::generic("child instance freed mid-dispatch"))?;
                let args = Variadic::from_iter([
                    LuaValue::Integer(start as i64),
                    LuaValue::Integer(end as i64),
                    payload.clone(),
                ]);
                self.vm.call_method(&child.vm_object, "decode", args)?;
                child.abs_cur_samplenum = end;
                child.drain_outbox()
            };
            self.route(child_id, child_calls)?;
        }
        Ok(())
    }
}

fn parse_annotation_payload(payload: &LuaValue) -> Result<(usize, Vec<String>)> {
    let t = match payload {
        LuaValue::Table(t) => t,
        other => {
            return Err(Error::arg(format!(
                "annotation payload must be [ann_class_index, strings], got {}",
                other.type_name()
            )))
        }
    };
    let ann_index: i64 = t.get(1)?;
    let strings_table: LuaTable = t.get(2)?;
    let mut strings = Vec::new();
    for s in strings_table.sequence_values::<String>() {
        strings.push(s?);
    }
    Ok((ann_index.max(0) as usize, strings))
}

fn parse_binary_payload(payload: &LuaValue) -> Result<(usize, Vec<u8>)> {
    let t = match payload {
        LuaValue::Table(t) => t,
        other => {
            return Err(Error::arg(format!(
                "binary payload must be [bin_class_index, bytes], got {}",
                other.type_name()
            )))
        }
    };
    let bin_index: i64 = t.get(1)?;
    let bytes = match t.get::<_, LuaValue>(2)? {
        LuaValue::String(s) => s.as_bytes().to_vec(),
        other => {
            return Err(Error::arg(format!(
                "binary payload bytes must be a string, got {}",
                other.type_name()
            )))
        }
    };
    Ok((bin_index.max(0) as usize, bytes))
}

fn parse_meta_payload(payload: &LuaValue) -> Result<(String, Value)> {
    let t = match payload {
        LuaValue::Table(t) => t,
        other => {
            return Err(Error::arg(format!(
                "metadata payload must be [key, value], got {}",
                other.type_name()
            )))
        }
    };
    let key: String = t.get(1)?;
    let value_lua: LuaValue = t.get(2)?;
    Ok((key, Value::from_lua(&value_lua)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{AnnotationClass, ChannelDesc};

    fn passthrough_decoder(lua: &mlua::Lua, id: &str) -> Arc<Decoder> {
        let class = lua.create_table().unwrap();
        class
            .set("start", lua.create_function(|_, _self_tbl: LuaTable| Ok(())).unwrap())
            .unwrap();
        class
            .set(
                "decode",
                lua.create_function(
                    |_, (self_tbl, ss, es, data): (LuaTable, i64, i64, mlua::Value)| {
                        let register: mlua::Function = self_tbl.get("register")?;
                        let port: usize = register.call((self_tbl.clone(), "annotation", mlua::Value::Nil))?;
                        let put: mlua::Function = self_tbl.get("put")?;
                        let strings = mlua::Value::Nil;
                        let _ = (data, strings);
                        let payload = {
                            let t = self_tbl.get::<_, LuaTable>("options").ok();
                            let _ = t;
                            mlua::Value::Nil
                        };
                        let _ = payload;
                        put.call::<_, ()>((self_tbl.clone(), ss, es, port, mlua::Value::Nil))?;
                        Ok(())
                    },
                )
                .unwrap(),
            )
            .unwrap();
        Arc::new(Decoder {
            id: id.into(),
            name: id.into(),
            long_name: id.into(),
            description: "".into(),
            license: "".into(),
            api_version: ApiVersion::V1,
            inputs: vec![],
            outputs: vec![],
            tags: vec![],
            channels: vec![ChannelDesc {
                id: "a".into(),
                name: "a".into(),
                description: "".into(),
                index: 0,
            }],
            optional_channels: vec![],
            options: vec![],
            annotations: vec![AnnotationClass {
                short: "x".into(),
                long: "X".into(),
            }],
            annotation_rows: vec![],
            binary: vec![],
            initial_pins: vec![],
            class_table: class,
        })
    }

    #[test]
    fn config_round_trips() {
        let vm = Vm::new();
        let mut session = Session::new(1, vm);
        session.config_set("NUM_CHANNELS", Value::Int(4)).unwrap();
        session.config_set("UNITSIZE", Value::Int(1)).unwrap();
        session.config_set("SAMPLERATE", Value::Int(1_000_000)).unwrap();
        assert_eq!(session.config_get("NUM_CHANNELS"), Some(Value::Int(4)));
        assert_eq!(session.config_get("UNITSIZE"), Some(Value::Int(1)));
    }

    #[test]
    fn send_rejects_non_contiguous_chunk() {
        let vm = Vm::new();
        let dec = passthrough_decoder(&vm.lock(), "p");
        let mut session = Session::new(1, vm);
        let id = session.instance_new(dec, None).unwrap();
        let mut map = HashMap::new();
        map.insert("a".to_string(), 0i64);
        session.channel_set_all(id, &map).unwrap();
        session.config_set("NUM_CHANNELS", Value::Int(1)).unwrap();
        session.config_set("UNITSIZE", Value::Int(1)).unwrap();
        session.config_set("SAMPLERATE", Value::Int(1_000_000)).unwrap();
        session.start().unwrap();

        session.send(0, &[0, 1, 0], 3).unwrap();
        let err = session.send(2, &[0, 1], 2).unwrap_err();
        assert!(matches!(err, Error::ArgError(_)));
    }

    #[test]
    fn send_zero_length_is_a_no_op() {
        let vm = Vm::new();
        let dec = passthrough_decoder(&vm.lock(), "p");
        let mut session = Session::new(1, vm);
        let id = session.instance_new(dec, None).unwrap();
        let mut map = HashMap::new();
        map.insert("a".to_string(), 0i64);
        session.channel_set_all(id, &map).unwrap();
        session.config_set("NUM_CHANNELS", Value::Int(1)).unwrap();
        session.config_set("UNITSIZE", Value::Int(1)).unwrap();
        session.config_set("SAMPLERATE", Value::Int(1_000_000)).unwrap();
        session.start().unwrap();
        assert!(session.send(0, &[], 0).is_ok());
    }

    #[test]
    fn stack_detaches_child_from_roots_and_unstack_restores_it() {
        let vm = Vm::new();
        let lua = vm.lock();
        let parent_dec = passthrough_decoder(&lua, "parent");
        let child_dec = passthrough_decoder(&lua, "child");
        drop(lua);

        let mut session = Session::new(1, vm);
        let parent = session.instance_new(parent_dec, None).unwrap();
        let child = session.instance_new(child_dec, None).unwrap();
        assert!(session.roots.contains(&child));

        session.stack(parent, child).unwrap();
        assert!(!session.roots.contains(&child));
        assert_eq!(session.instances[parent].as_ref().unwrap().children, vec![child]);

        session.unstack(child).unwrap();
        assert!(session.roots.contains(&child));
        assert!(session.instances[parent].as_ref().unwrap().children.is_empty());
    }

    #[test]
    fn stack_rejects_cycles() {
        let vm = Vm::new();
        let lua = vm.lock();
        let a_dec = passthrough_decoder(&lua, "a");
        let b_dec = passthrough_decoder(&lua, "b");
        drop(lua);

        let mut session = Session::new(1, vm);
        let a = session.instance_new(a_dec, None).unwrap();
        let b = session.instance_new(b_dec, None).unwrap();
        session.stack(a, b).unwrap();
        assert!(session.stack(b, a).is_err());
    }
}
