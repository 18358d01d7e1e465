//! Values that cross the VM boundary: option defaults/overrides, metadata,
//! and the strings/bytes carried by annotation and binary outputs.

use crate::error::{Error, Result};
use mlua::Value as LuaValue;

/// A typed scalar, matching the three option-default types the spec allows
/// (§4.1) plus the bytes/list/dict shapes §4.7 asks the bridge to marshal.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    List(Vec<Value>),
}

impl Value {
    /// Name of this value's type, for `ArgError` messages when an override
    /// doesn't match an option's declared default type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Bool(_) => "bool",
            Value::List(_) => "list",
        }
    }

    pub fn same_type(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn to_lua(&self, lua: &mlua::Lua) -> Result<LuaValue> {
        Ok(match self {
            Value::Int(i) => LuaValue::Integer(*i),
            Value::Float(f) => LuaValue::Number(*f),
            Value::Str(s) => LuaValue::String(lua.create_string(s)?),
            Value::Bytes(b) => LuaValue::String(lua.create_string(b)?),
            Value::Bool(b) => LuaValue::Boolean(*b),
            Value::List(items) => {
                let table = lua.create_table()?;
                for (i, item) in items.iter().enumerate() {
                    table.set(i + 1, item.to_lua(lua)?)?;
                }
                LuaValue::Table(table)
            }
        })
    }

    pub fn from_lua(value: &LuaValue) -> Result<Value> {
        match value {
            LuaValue::Integer(i) => Ok(Value::Int(*i)),
            LuaValue::Number(f) => Ok(Value::Float(*f)),
            LuaValue::Boolean(b) => Ok(Value::Bool(*b)),
            LuaValue::String(s) => {
                let bytes = s.as_bytes();
                match std::str::from_utf8(&bytes) {
                    Ok(text) => Ok(Value::Str(text.to_string())),
                    Err(_) => Ok(Value::Bytes(bytes.to_vec())),
                }
            }
            LuaValue::Table(t) => {
                let len = t.raw_len();
                let mut items = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: LuaValue = t.get(i)?;
                    items.push(Value::from_lua(&v)?);
                }
                Ok(Value::List(items))
            }
            other => Err(Error::arg(format!(
                "value of Lua type {:?} cannot be marshalled",
                other.type_name()
            ))),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_type_ignores_payload() {
        assert!(Value::Int(1).same_type(&Value::Int(2)));
        assert!(!Value::Int(1).same_type(&Value::Float(1.0)));
    }

    #[test]
    fn round_trip_scalar_through_lua() {
        let lua = mlua::Lua::new();
        for v in [
            Value::Int(42),
            Value::Float(1.5),
            Value::Str("hi".into()),
            Value::Bool(true),
        ] {
            let lv = v.to_lua(&lua).unwrap();
            let back = Value::from_lua(&lv).unwrap();
            assert_eq!(v, back);
        }
    }

    #[test]
    fn round_trip_list() {
        let lua = mlua::Lua::new();
        let v = Value::List(vec![Value::Int(1), Value::Str("a".into())]);
        let lv = v.to_lua(&lua).unwrap();
        let back = Value::from_lua(&lv).unwrap();
        assert_eq!(v, back);
    }
}
