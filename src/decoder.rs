//! Decoder (class) metadata — immutable once loaded (spec §3, §4.1).

use crate::value::Value;
use mlua::Table;

/// Push (call-driven) vs. pull (`wait`-driven) execution, selected by the
/// decoder's declared `api_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

impl ApiVersion {
    pub fn from_raw(n: i64) -> Self {
        if n == 2 {
            ApiVersion::V2
        } else {
            ApiVersion::V1
        }
    }
}

/// One required or optional channel declaration.
#[derive(Debug, Clone)]
pub struct ChannelDesc {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Stable index into the decoder's declared channel order: required
    /// channels are `0..R-1`, optional channels `R..R+O-1`.
    pub index: usize,
}

/// One option declaration, including the default value used when an
/// instance doesn't override it.
#[derive(Debug, Clone)]
pub struct OptionDesc {
    pub id: String,
    pub description: String,
    pub default: Value,
    /// Optional enumeration of legal values; `option_set` rejects anything
    /// outside this list when present.
    pub values: Option<Vec<Value>>,
}

/// One annotation class (`[short, long]` in the plug-in contract).
#[derive(Debug, Clone)]
pub struct AnnotationClass {
    pub short: String,
    pub long: String,
}

/// A row grouping a set of annotation class indices under one UI label.
#[derive(Debug, Clone)]
pub struct AnnotationRow {
    pub id: String,
    pub name: String,
    pub ann_indices: Vec<usize>,
}

/// One binary class (`[id, desc]`).
#[derive(Debug, Clone)]
pub struct BinaryClass {
    pub id: String,
    pub description: String,
}

/// A loaded, validated decoder plug-in. Immutable after `decoder_load`.
pub struct Decoder {
    pub id: String,
    pub name: String,
    pub long_name: String,
    pub description: String,
    pub license: String,
    pub api_version: ApiVersion,
    /// Opaque descriptive metadata (§6): not consulted by any runtime
    /// behavior, only surfaced to host front-ends via `decoder_list`.
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub tags: Vec<String>,
    pub channels: Vec<ChannelDesc>,
    pub optional_channels: Vec<ChannelDesc>,
    pub options: Vec<OptionDesc>,
    pub annotations: Vec<AnnotationClass>,
    pub annotation_rows: Vec<AnnotationRow>,
    pub binary: Vec<BinaryClass>,
    /// Initial pin values for `pin_history` before the first sample, keyed
    /// by channel index. Channels absent from this map default to 0.
    pub initial_pins: Vec<(usize, u8)>,
    /// The VM-side class table (the module's returned Lua table).
    pub(crate) class_table: Table,
}

impl Decoder {
    /// Total number of declared channels (required + optional), the width
    /// of every instance's `channel_map`.
    pub fn num_channels(&self) -> usize {
        self.channels.len() + self.optional_channels.len()
    }

    /// Channel index -> declared id, across required then optional.
    pub fn channel_id_at(&self, index: usize) -> Option<&str> {
        if index < self.channels.len() {
            Some(&self.channels[index].id)
        } else {
            self.optional_channels
                .get(index - self.channels.len())
                .map(|c| c.id.as_str())
        }
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("id", &self.id)
            .field("api_version", &self.api_version)
            .field("channels", &self.channels.len())
            .field("optional_channels", &self.optional_channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_channels(ids: &[&str]) -> Vec<ChannelDesc> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| ChannelDesc {
                id: id.to_string(),
                name: id.to_string(),
                description: String::new(),
                index: i,
            })
            .collect()
    }

    #[test]
    fn num_channels_sums_required_and_optional() {
        let lua = mlua::Lua::new();
        let d = Decoder {
            id: "t".into(),
            name: "t".into(),
            long_name: "t".into(),
            description: "".into(),
            license: "".into(),
            api_version: ApiVersion::V1,
            inputs: vec![],
            outputs: vec![],
            tags: vec![],
            channels: make_channels(&["a", "b"]),
            optional_channels: make_channels(&["c"]),
            options: vec![],
            annotations: vec![],
            annotation_rows: vec![],
            binary: vec![],
            initial_pins: vec![],
            class_table: lua.create_table().unwrap(),
        };
        assert_eq!(d.num_channels(), 3);
        assert_eq!(d.channel_id_at(0), Some("a"));
        assert_eq!(d.channel_id_at(2), Some("c"));
        assert_eq!(d.channel_id_at(3), None);
    }
}
