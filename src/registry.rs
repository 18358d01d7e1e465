//! Decoder registry (spec §4.1): load, validate, and catalog decoder
//! plug-ins.

use std::path::PathBuf;
use std::sync::Arc;

use mlua::{Table as LuaTable, Value as LuaValue};

use crate::decoder::{AnnotationClass, AnnotationRow, BinaryClass, ChannelDesc, Decoder, OptionDesc};
use crate::error::{Error, Result};
use crate::value::Value;
use crate::vm::Vm;

/// Loaded decoder plug-ins, in load order. `decoder_load` is idempotent by
/// module name (invariant 9: loading twice yields one entry).
#[derive(Default)]
pub struct Registry {
    decoders: Vec<Arc<Decoder>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// `decoder_load(module_name)`.
    pub fn load(&mut self, vm: &Vm, search_paths: &[PathBuf], module_name: &str) -> Result<Arc<Decoder>> {
        if let Some(existing) = self.get(module_name) {
            return Ok(existing);
        }
        let class_table = vm.load_module(search_paths, module_name)?;
        let decoder = build_decoder(vm, class_table)?;
        let decoder = Arc::new(decoder);
        self.decoders.push(decoder.clone());
        tracing::info!(decoder = %decoder.id, "decoder loaded");
        Ok(decoder)
    }

    /// `decoder_list()`: stable iteration in load order.
    pub fn list(&self) -> &[Arc<Decoder>] {
        &self.decoders
    }

    /// `decoder_get(id)`: O(n) lookup by id.
    pub fn get(&self, id: &str) -> Option<Arc<Decoder>> {
        self.decoders.iter().find(|d| d.id == id).cloned()
    }

    /// Remove the registry entry. The caller (`Runtime::decoder_unload`) is
    /// responsible for tearing down every session that references it first.
    pub fn remove(&mut self, id: &str) -> Option<Arc<Decoder>> {
        let pos = self.decoders.iter().position(|d| d.id == id)?;
        tracing::info!(decoder = %id, "decoder unloaded");
        Some(self.decoders.remove(pos))
    }
}

/// Validate a freshly-loaded module table and extract its metadata. Fails
/// with `ArgError` on any malformed attribute, taking no lasting action on
/// the registry (the caller only pushes on success, so a failed load leaks
/// nothing into the catalog).
fn build_decoder(vm: &Vm, class_table: LuaTable) -> Result<Decoder> {
    // Every table read below touches the VM, so hold the lock for the
    // whole validation pass even though no Lua handle is named directly.
    let _guard = vm.lock();

    let has_start = matches!(class_table.get::<_, LuaValue>("start")?, LuaValue::Function(_));
    let has_decode = matches!(class_table.get::<_, LuaValue>("decode")?, LuaValue::Function(_));
    if !has_start || !has_decode {
        return Err(Error::arg(
            "decoder module must define start and decode methods",
        ));
    }

    let id: String = required_string(&class_table, "id")?;
    let name = optional_string(&class_table, "name")?.unwrap_or_else(|| id.clone());
    let long_name = optional_string(&class_table, "long_name")?.unwrap_or_else(|| name.clone());
    let description = optional_string(&class_table, "desc")?.unwrap_or_default();
    let license = optional_string(&class_table, "license")?.unwrap_or_default();
    let api_version = match class_table.get::<_, LuaValue>("api_version")? {
        LuaValue::Integer(n) => crate::decoder::ApiVersion::from_raw(n),
        LuaValue::Nil => crate::decoder::ApiVersion::from_raw(1),
        other => {
            return Err(Error::arg(format!(
                "api_version must be an integer, got {}",
                other.type_name()
            )))
        }
    };

    let inputs = string_list(&class_table, "inputs")?;
    let outputs = string_list(&class_table, "outputs")?;
    let tags = string_list(&class_table, "tags")?;

    let channels = parse_channels(&class_table, "channels", 0)?;
    let optional_channels = parse_channels(&class_table, "optional_channels", channels.len())?;
    let options = parse_options(&class_table)?;
    let annotations = parse_annotations(&class_table)?;
    let annotation_rows = parse_annotation_rows(&class_table)?;
    let binary = parse_binary(&class_table)?;
    let initial_pins = parse_initial_pins(&class_table, &channels, &optional_channels)?;

    Ok(Decoder {
        id,
        name,
        long_name,
        description,
        license,
        api_version,
        inputs,
        outputs,
        tags,
        channels,
        optional_channels,
        options,
        annotations,
        annotation_rows,
        binary,
        initial_pins,
        class_table,
    })
}

fn required_string(t: &LuaTable, field: &str) -> Result<String> {
    optional_string(t, field)?.ok_or_else(|| Error::arg(format!("decoder is missing required field {field:?}")))
}

fn optional_string(t: &LuaTable, field: &str) -> Result<Option<String>> {
    match t.get::<_, LuaValue>(field)? {
        LuaValue::Nil => Ok(None),
        LuaValue::String(s) => Ok(Some(s.to_str()?.to_string())),
        other => Err(Error::arg(format!(
            "field {field:?} must be a string, got {}",
            other.type_name()
        ))),
    }
}

fn string_list(t: &LuaTable, field: &str) -> Result<Vec<String>> {
    match t.get::<_, LuaValue>(field)? {
        LuaValue::Nil => Ok(Vec::new()),
        LuaValue::Table(list) => {
            let mut out = Vec::new();
            for v in list.sequence_values::<String>() {
                out.push(v?);
            }
            Ok(out)
        }
        other => Err(Error::arg(format!(
            "field {field:?} must be a list of strings, got {}",
            other.type_name()
        ))),
    }
}

fn parse_channels(t: &LuaTable, field: &str, start_index: usize) -> Result<Vec<ChannelDesc>> {
    let list = match t.get::<_, LuaValue>(field)? {
        LuaValue::Nil => return Ok(Vec::new()),
        LuaValue::Table(l) => l,
        other => {
            return Err(Error::arg(format!(
                "field {field:?} must be a list of channel records, got {}",
                other.type_name()
            )))
        }
    };
    let mut out = Vec::new();
    for (i, entry) in list.sequence_values::<LuaTable>().enumerate() {
        let entry = entry?;
        out.push(ChannelDesc {
            id: required_string(&entry, "id")?,
            name: optional_string(&entry, "name")?.unwrap_or_default(),
            description: optional_string(&entry, "desc")?.unwrap_or_default(),
            index: start_index + i,
        });
    }
    Ok(out)
}

fn parse_options(t: &LuaTable) -> Result<Vec<OptionDesc>> {
    let list = match t.get::<_, LuaValue>("options")? {
        LuaValue::Nil => return Ok(Vec::new()),
        LuaValue::Table(l) => l,
        other => {
            return Err(Error::arg(format!(
                "field \"options\" must be a list of option records, got {}",
                other.type_name()
            )))
        }
    };
    let mut out = Vec::new();
    for entry in list.sequence_values::<LuaTable>() {
        let entry = entry?;
        let id = required_string(&entry, "id")?;
        let description = optional_string(&entry, "desc")?.unwrap_or_default();
        let default = Value::from_lua(&entry.get::<_, LuaValue>("default")?)?;
        let values = match entry.get::<_, LuaValue>("values")? {
            LuaValue::Nil => None,
            LuaValue::Table(vs) => {
                let mut parsed = Vec::new();
                for v in vs.sequence_values::<LuaValue>() {
                    parsed.push(Value::from_lua(&v?)?);
                }
                Some(parsed)
            }
            other => {
                return Err(Error::arg(format!(
                    "option {id} values must be a list, got {}",
                    other.type_name()
                )))
            }
        };
        out.push(OptionDesc {
            id,
            description,
            default,
            values,
        });
    }
    Ok(out)
}

fn parse_annotations(t: &LuaTable) -> Result<Vec<AnnotationClass>> {
    let list = match t.get::<_, LuaValue>("annotations")? {
        LuaValue::Nil => return Ok(Vec::new()),
        LuaValue::Table(l) => l,
        other => {
            return Err(Error::arg(format!(
                "field \"annotations\" must be a list of [short, long] pairs, got {}",
                other.type_name()
            )))
        }
    };
    let mut out = Vec::new();
    for entry in list.sequence_values::<LuaTable>() {
        let entry = entry?;
        out.push(AnnotationClass {
            short: entry.get(1)?,
            long: entry.get(2)?,
        });
    }
    Ok(out)
}

fn parse_annotation_rows(t: &LuaTable) -> Result<Vec<AnnotationRow>> {
    let list = match t.get::<_, LuaValue>("annotation_rows")? {
        LuaValue::Nil => return Ok(Vec::new()),
        LuaValue::Table(l) => l,
        other => {
            return Err(Error::arg(format!(
                "field \"annotation_rows\" must be a list of [id, name, indices] records, got {}",
                other.type_name()
            )))
        }
    };
    let mut out = Vec::new();
    for entry in list.sequence_values::<LuaTable>() {
        let entry = entry?;
        let id: String = entry.get(1)?;
        let name: String = entry.get(2)?;
        let indices_table: LuaTable = entry.get(3)?;
        let mut ann_indices = Vec::new();
        for idx in indices_table.sequence_values::<i64>() {
            ann_indices.push(idx? as usize);
        }
        out.push(AnnotationRow {
            id,
            name,
            ann_indices,
        });
    }
    Ok(out)
}

fn parse_binary(t: &LuaTable) -> Result<Vec<BinaryClass>> {
    let list = match t.get::<_, LuaValue>("binary")? {
        LuaValue::Nil => return Ok(Vec::new()),
        LuaValue::Table(l) => l,
        other => {
            return Err(Error::arg(format!(
                "field \"binary\" must be a list of [id, desc] pairs, got {}",
                other.type_name()
            )))
        }
    };
    let mut out = Vec::new();
    for entry in list.sequence_values::<LuaTable>() {
        let entry = entry?;
        out.push(BinaryClass {
            id: entry.get(1)?,
            description: entry.get(2)?,
        });
    }
    Ok(out)
}

fn parse_initial_pins(
    t: &LuaTable,
    channels: &[ChannelDesc],
    optional_channels: &[ChannelDesc],
) -> Result<Vec<(usize, u8)>> {
    let pins = match t.get::<_, LuaValue>("initial_pins")? {
        LuaValue::Nil => return Ok(Vec::new()),
        LuaValue::Table(p) => p,
        other => {
            return Err(Error::arg(format!(
                "field \"initial_pins\" must be a map of channel id to 0/1, got {}",
                other.type_name()
            )))
        }
    };
    let mut out = Vec::new();
    for pair in pins.pairs::<String, i64>() {
        let (name, value) = pair?;
        let index = channels
            .iter()
            .chain(optional_channels.iter())
            .find(|c| c.id == name)
            .map(|c| c.index)
            .ok_or_else(|| Error::arg(format!("initial_pins names unknown channel {name:?}")))?;
        out.push((index, (value != 0) as u8));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_decoder(dir: &std::path::Path, name: &str, src: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let mut f = std::fs::File::create(dir.join(format!("{name}.lua"))).unwrap();
        write!(f, "{src}").unwrap();
    }

    const MINIMAL_DECODER: &str = r#"
        local M = {}
        M.id = 'minimal'
        M.name = 'minimal'
        M.desc = 'a minimal test decoder'
        M.api_version = 1
        M.channels = { { id = 'a', name = 'A', desc = 'channel a' } }
        M.options = { { id = 'opt', desc = 'an option', default = 1 } }
        M.annotations = { { 'x', 'X annotation' } }
        function M.start(self) end
        function M.decode(self, ss, es, data) end
        return M
    "#;

    #[test]
    fn load_parses_full_metadata() {
        let dir = std::env::temp_dir().join(format!("sigdecode-registry-test-{}", std::process::id()));
        write_decoder(&dir, "minimal", MINIMAL_DECODER);

        let vm = Vm::new();
        let mut registry = Registry::new();
        let dec = registry.load(&vm, &[dir.clone()], "minimal").unwrap();
        assert_eq!(dec.id, "minimal");
        assert_eq!(dec.channels.len(), 1);
        assert_eq!(dec.options.len(), 1);
        assert_eq!(dec.annotations.len(), 1);
        assert_eq!(registry.list().len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_is_idempotent_by_id() {
        let dir = std::env::temp_dir().join(format!("sigdecode-registry-test2-{}", std::process::id()));
        write_decoder(&dir, "minimal", MINIMAL_DECODER);

        let vm = Vm::new();
        let mut registry = Registry::new();
        registry.load(&vm, &[dir.clone()], "minimal").unwrap();
        registry.load(&vm, &[dir.clone()], "minimal").unwrap();
        assert_eq!(registry.list().len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_rejects_missing_decode_method() {
        let dir = std::env::temp_dir().join(format!("sigdecode-registry-test3-{}", std::process::id()));
        write_decoder(
            &dir,
            "broken",
            "local M = {} M.id = 'broken' function M.start(self) end return M",
        );

        let vm = Vm::new();
        let mut registry = Registry::new();
        assert!(registry.load(&vm, &[dir.clone()], "broken").is_err());
        assert_eq!(registry.list().len(), 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
