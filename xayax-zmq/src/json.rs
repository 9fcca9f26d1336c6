//! Strict JSON parsing for user-provided move data.

use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};
use tracing::warn;

/// Parses a move payload as strict JSON.
///
/// On top of the usual syntax rules (no comments, no trailing garbage, no
/// non-finite numbers), objects with duplicate keys at any nesting level
/// are rejected, as is anything whose top level is not an object.  Returns
/// `None` for anything invalid; the move is then simply skipped.
pub fn parse_move_json(data: &str) -> Option<Map<String, Value>> {
    let mut de = serde_json::Deserializer::from_str(data);
    let value = match StrictValue.deserialize(&mut de).and_then(|v| {
        de.end()?;
        Ok(v)
    }) {
        Ok(value) => value,
        Err(err) => {
            warn!(%err, data, "move data is invalid JSON");
            return None;
        }
    };

    match value {
        Value::Object(obj) => Some(obj),
        _ => {
            warn!(data, "move data is not a JSON object");
            None
        }
    }
}

/// A [`DeserializeSeed`] building a [`Value`] while rejecting duplicate
/// object keys, which the default [`Value`] deserialisation silently
/// resolves in favour of the last occurrence.
struct StrictValue;

impl<'de> DeserializeSeed<'de> for StrictValue {
    type Value = Value;

    fn deserialize<D>(self, deserializer: D) -> Result<Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(StrictVisitor)
    }
}

struct StrictVisitor;

impl<'de> Visitor<'de> for StrictVisitor {
    type Value = Value;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("any valid JSON value")
    }

    fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .ok_or_else(|| de::Error::custom("non-finite number"))
    }

    fn visit_str<E>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut values = Vec::new();
        while let Some(value) = seq.next_element_seed(StrictValue)? {
            values.push(value);
        }
        Ok(Value::Array(values))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut obj = Map::new();
        while let Some(key) = map.next_key::<String>()? {
            let value = map.next_value_seed(StrictValue)?;
            if obj.insert(key.clone(), value).is_some() {
                return Err(de::Error::custom(format!("duplicate key {key:?}")));
            }
        }
        Ok(Value::Object(obj))
    }
}
