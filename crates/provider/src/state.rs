//! Terraform State Management
//!
//! Handles encoding and decoding of Terraform values. Terraform core sends
//! `DynamicValue`s as MessagePack; the JSON form only shows up in raw
//! states handed to `UpgradeResourceState`.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};

use crate::tfplugin6;

/// MessagePack extension code Terraform uses for unknown values.
const UNKNOWN_EXT: i8 = 0;

/// A Terraform value as seen by the provider.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    /// Not known until apply
    Unknown,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    /// Lists, sets and tuples
    List(Vec<Value>),
    /// Maps and objects
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.get(key)
    }

    /// Set an attribute on an object value. Non-objects are turned into one.
    pub fn set(&mut self, key: &str, value: Value) {
        if !matches!(self, Value::Map(_)) {
            *self = Value::Map(BTreeMap::new());
        }
        if let Value::Map(m) = self {
            m.insert(key.to_string(), value);
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown)
    }

    /// True when the value and everything nested in it is known.
    pub fn is_wholly_known(&self) -> bool {
        match self {
            Value::Unknown => false,
            Value::List(items) => items.iter().all(Value::is_wholly_known),
            Value::Map(m) => m.values().all(Value::is_wholly_known),
            _ => true,
        }
    }

    /// Zero values in the Go sense: `""`, `0`, `false`, empty collections.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Unknown => false,
            Value::Bool(b) => !b,
            Value::Number(n) => n.as_f64() == Some(0.0),
            Value::String(s) => s.is_empty(),
            Value::List(items) => items.is_empty(),
            Value::Map(m) => m.is_empty(),
        }
    }

    /// Replace unknowns with nulls; new state after apply must be wholly known.
    pub fn unknowns_to_null(self) -> Value {
        match self {
            Value::Unknown => Value::Null,
            Value::List(items) => {
                Value::List(items.into_iter().map(Value::unknowns_to_null).collect())
            }
            Value::Map(m) => Value::Map(
                m.into_iter()
                    .map(|(k, v)| (k, v.unknowns_to_null()))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(m) => {
                Value::Map(m.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// JSON view of a value; unknowns become null.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null | Value::Unknown => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Value::Number(n.clone()),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Map(m) => serde_json::Value::Object(
            m.iter().map(|(k, v)| (k.clone(), to_json(v))).collect(),
        ),
    }
}

fn from_msgpack(value: rmpv::Value) -> Result<Value> {
    Ok(match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                Value::Number(n.into())
            } else if let Some(n) = i.as_u64() {
                Value::Number(n.into())
            } else {
                bail!("integer out of range")
            }
        }
        rmpv::Value::F32(f) => float_value(f as f64),
        rmpv::Value::F64(f) => float_value(f),
        rmpv::Value::String(s) => Value::String(
            s.into_str().ok_or_else(|| anyhow!("string is not valid UTF-8"))?,
        ),
        rmpv::Value::Binary(b) => Value::String(String::from_utf8(b)?),
        rmpv::Value::Array(items) => {
            Value::List(items.into_iter().map(from_msgpack).collect::<Result<_>>()?)
        }
        rmpv::Value::Map(entries) => {
            let mut map = BTreeMap::new();
            for (k, v) in entries {
                let key = match k {
                    rmpv::Value::String(s) => s
                        .into_str()
                        .ok_or_else(|| anyhow!("map key is not valid UTF-8"))?,
                    other => bail!("unsupported map key {}", other),
                };
                map.insert(key, from_msgpack(v)?);
            }
            Value::Map(map)
        }
        // Refined unknowns use other extension codes; all of them mean unknown here.
        rmpv::Value::Ext(_, _) => Value::Unknown,
    })
}

fn to_msgpack(value: &Value) -> rmpv::Value {
    match value {
        Value::Null => rmpv::Value::Nil,
        Value::Unknown => rmpv::Value::Ext(UNKNOWN_EXT, vec![0]),
        Value::Bool(b) => rmpv::Value::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rmpv::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                rmpv::Value::from(u)
            } else {
                rmpv::Value::F64(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => rmpv::Value::from(s.as_str()),
        Value::List(items) => rmpv::Value::Array(items.iter().map(to_msgpack).collect()),
        Value::Map(m) => rmpv::Value::Map(
            m.iter()
                .map(|(k, v)| (rmpv::Value::from(k.as_str()), to_msgpack(v)))
                .collect(),
        ),
    }
}

/// Decode MessagePack bytes. Empty input decodes to null.
pub fn decode_msgpack(data: &[u8]) -> Result<Value> {
    if data.is_empty() {
        return Ok(Value::Null);
    }
    let mut reader = data;
    let value = rmpv::decode::read_value(&mut reader)?;
    from_msgpack(value)
}

/// Encode a value as MessagePack bytes.
pub fn encode_msgpack(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &to_msgpack(value))?;
    Ok(buf)
}

/// Decode JSON bytes. Empty input decodes to null.
pub fn decode_json(data: &[u8]) -> Result<Value> {
    if data.is_empty() {
        return Ok(Value::Null);
    }
    let value: serde_json::Value = serde_json::from_slice(data)?;
    Ok(value.into())
}

/// Decode a Terraform DynamicValue, preferring the MessagePack payload
pub fn decode_dynamic_value(value: Option<&tfplugin6::DynamicValue>) -> Result<Value> {
    match value {
        None => Ok(Value::Null),
        Some(v) if !v.msgpack.is_empty() => decode_msgpack(&v.msgpack),
        Some(v) => decode_json(&v.json),
    }
}

/// Encode a value to a Terraform DynamicValue
pub fn encode_dynamic_value(value: &Value) -> Result<tfplugin6::DynamicValue> {
    Ok(tfplugin6::DynamicValue {
        msgpack: encode_msgpack(value)?,
        json: vec![],
    })
}

/// Helper to extract a string attribute from a Value
pub fn get_string_attr(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// Helper to extract an optional, non-empty string attribute
pub fn get_optional_string_attr(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    })
}

/// Helper to extract an integer attribute from a Value
pub fn get_int_attr(value: &Value, key: &str, default: i64) -> i64 {
    value.get(key).and_then(|v| v.as_i64()).unwrap_or(default)
}

/// Helper to extract a bool attribute from a Value
pub fn get_bool_attr(value: &Value, key: &str, default: bool) -> bool {
    value.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

/// Elements of a list attribute; absent or null lists are empty.
pub fn get_list_attr<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value.get(key).and_then(Value::as_list).unwrap_or(&[])
}

pub fn get_string_list_attr(value: &Value, key: &str) -> Vec<String> {
    get_list_attr(value, key)
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

pub fn get_string_map_attr(value: &Value, key: &str) -> BTreeMap<String, String> {
    value
        .get(key)
        .and_then(Value::as_map)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// The attribute when it is set to something other than its zero value.
pub fn get_ok<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .get(key)
        .filter(|v| !v.is_null() && !v.is_unknown() && !v.is_zero())
}

/// Create an object Value with the given attributes
pub fn make_state(attrs: Vec<(&str, Value)>) -> Value {
    Value::Map(
        attrs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

/// Create a string Value
pub fn string_value(s: impl Into<String>) -> Value {
    Value::String(s.into())
}

/// Create a number Value from i64
pub fn int_value(n: i64) -> Value {
    Value::Number(serde_json::Number::from(n))
}

/// Create a number Value from f64
pub fn float_value(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Create a bool Value
pub fn bool_value(b: bool) -> Value {
    Value::Bool(b)
}

/// Create a null Value
pub fn null_value() -> Value {
    Value::Null
}

/// A string, or null when empty
pub fn optional_string_value(s: Option<impl Into<String>>) -> Value {
    match s.map(Into::into) {
        Some(s) if !s.is_empty() => Value::String(s),
        _ => Value::Null,
    }
}

pub fn list_value(items: Vec<Value>) -> Value {
    Value::List(items)
}

pub fn string_list_value<I, S>(items: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Value::List(items.into_iter().map(|s| Value::String(s.into())).collect())
}

pub fn string_map_value<'a, I>(entries: I) -> Value
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_encodes_as_extension_zero() {
        let bytes = encode_msgpack(&Value::Unknown).unwrap();
        assert_eq!(bytes, vec![0xd4, 0x00, 0x00]);
        assert_eq!(decode_msgpack(&bytes).unwrap(), Value::Unknown);
    }

    #[test]
    fn test_null_and_empty_input() {
        assert_eq!(encode_msgpack(&Value::Null).unwrap(), vec![0xc0]);
        assert_eq!(decode_msgpack(&[]).unwrap(), Value::Null);
        assert_eq!(decode_dynamic_value(None).unwrap(), Value::Null);
    }

    #[test]
    fn test_object_through_msgpack() {
        let state = make_state(vec![
            ("id", string_value("default/vm1")),
            ("cpu", int_value(2)),
            ("efi", bool_value(false)),
            ("tags", string_map_value(&BTreeMap::from([("env".to_string(), "dev".to_string())]))),
            ("ssh_keys", string_list_value(["default/key"])),
            ("hostname", Value::Unknown),
        ]);
        let decoded = decode_msgpack(&encode_msgpack(&state).unwrap()).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(get_int_attr(&decoded, "cpu", 0), 2);
        assert_eq!(get_string_list_attr(&decoded, "ssh_keys"), vec!["default/key"]);
    }

    #[test]
    fn test_json_raw_state() {
        let value = decode_json(br#"{"name":"ubuntu","size":1024,"tags":null}"#).unwrap();
        assert_eq!(get_string_attr(&value, "name"), "ubuntu");
        assert_eq!(get_int_attr(&value, "size", 0), 1024);
        assert!(value.get("tags").unwrap().is_null());
    }

    #[test]
    fn test_get_ok_skips_zero_values() {
        let value = make_state(vec![
            ("empty", string_value("")),
            ("zero", int_value(0)),
            ("off", bool_value(false)),
            ("unknown", Value::Unknown),
            ("set", string_value("x")),
        ]);
        assert!(get_ok(&value, "empty").is_none());
        assert!(get_ok(&value, "zero").is_none());
        assert!(get_ok(&value, "off").is_none());
        assert!(get_ok(&value, "unknown").is_none());
        assert!(get_ok(&value, "missing").is_none());
        assert_eq!(get_ok(&value, "set"), Some(&string_value("x")));
    }

    #[test]
    fn test_unknowns_to_null() {
        let value = make_state(vec![
            ("a", Value::Unknown),
            ("b", list_value(vec![Value::Unknown])),
        ]);
        let cleaned = value.unknowns_to_null();
        assert!(cleaned.is_wholly_known());
        assert_eq!(cleaned.get("a"), Some(&Value::Null));
    }

    #[test]
    fn test_to_json() {
        let value = make_state(vec![("name", string_value("x")), ("id", Value::Unknown)]);
        assert_eq!(to_json(&value), serde_json::json!({"id": null, "name": "x"}));
    }
}
