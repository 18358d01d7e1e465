//! API v1 execution (push model, spec §4.4.1): synchronously call
//! `decode(self, startsample, endsample, data)`, `data` being the whole
//! chunk's samples projected through the channel map.

use mlua::{Value as LuaValue, Variadic};

use super::{Instance, PutCall};
use crate::error::Result;
use crate::sample_view::SampleIterator;
use crate::vm::Vm;

/// Run one chunk through a v1 instance and return the `put()` calls it
/// produced, in emission order.
pub fn run_chunk(
    vm: &Vm,
    inst: &mut Instance,
    buf: &[u8],
    start_samplenum: u64,
    end_samplenum: u64,
) -> Result<Vec<PutCall>> {
    let data_table = {
        let lua = vm.lock();
        let table = lua.create_table()?;
        let it = SampleIterator::new(
            buf,
            inst.data_unitsize as usize,
            &inst.channel_map,
            start_samplenum,
        );
        for (i, (samplenum, bytes)) in it.enumerate() {
            let pair = lua.create_table()?;
            pair.set(1, samplenum)?;
            let byte_table = lua.create_table()?;
            for (j, b) in bytes.iter().enumerate() {
                byte_table.set(j + 1, *b)?;
            }
            pair.set(2, byte_table)?;
            table.set(i + 1, pair)?;
        }
        table
    };

    let args: Variadic<LuaValue> = Variadic::from_iter([
        LuaValue::Integer(start_samplenum as i64),
        LuaValue::Integer(end_samplenum as i64),
        LuaValue::Table(data_table),
    ]);
    vm.call_method(&inst.vm_object, "decode", args)?;

    inst.abs_cur_samplenum = end_samplenum;
    Ok(inst.drain_outbox())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{ApiVersion, ChannelDesc, Decoder};
    use std::sync::Arc;

    fn echo_decoder(lua: &mlua::Lua) -> Arc<Decoder> {
        let class = lua.create_table().unwrap();
        class
            .set("start", lua.create_function(|_, _self_tbl: mlua::Table| Ok(())).unwrap())
            .unwrap();
        class
            .set(
                "decode",
                lua.create_function(
                    |_, (self_tbl, ss, es, data): (mlua::Table, i64, i64, mlua::Table)| {
                        let put: mlua::Function = self_tbl.get("put")?;
                        let _ = (ss, es);
                        for pair in data.sequence_values::<mlua::Table>() {
                            let pair = pair?;
                            let samplenum: i64 = pair.get(1)?;
                            put.call::<_, ()>((self_tbl.clone(), samplenum, samplenum, 0usize, "x"))?;
                        }
                        Ok(())
                    },
                )
                .unwrap(),
            )
            .unwrap();
        Arc::new(Decoder {
            id: "echo".into(),
            name: "echo".into(),
            long_name: "echo".into(),
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
            annotations: vec![],
            annotation_rows: vec![],
            binary: vec![],
            initial_pins: vec![],
            class_table: class,
        })
    }

    #[test]
    fn run_chunk_emits_one_put_per_sample() {
        let vm = Vm::new();
        let dec = echo_decoder(&vm.lock());
        let mut inst = Instance::new(&vm, dec, "echo-1".into()).unwrap();
        let mut map = std::collections::HashMap::new();
        map.insert("a".to_string(), 0i64);
        inst.channel_set_all(&map).unwrap();
        inst.start(&vm, 1, 1, 1_000_000).unwrap();

        let buf = [0u8, 1u8, 0u8];
        let calls = run_chunk(&vm, &mut inst, &buf, 0, 3).unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(inst.abs_cur_samplenum, 3);
    }
}
