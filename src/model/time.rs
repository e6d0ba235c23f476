//! Timestamp parsing for wire input.
//!
//! Clients send timestamps either as RFC 3339 strings, as milliseconds since
//! the epoch, or as protobuf-style `{seconds, nanos}` objects.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

pub fn parse(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Object(map) => {
            let seconds = match map.get("seconds")? {
                Value::Number(n) => n.as_i64()?,
                Value::String(s) => s.parse().ok()?,
                _ => return None,
            };
            let nanos = map.get("nanos").and_then(Value::as_u64).unwrap_or(0);
            Utc.timestamp_opt(seconds, u32::try_from(nanos).ok()?).single()
        }
        _ => None,
    }
}

/// `deserialize_with` helper for optional timestamps in any accepted shape.
pub fn deserialize_optional<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => parse(&value)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid timestamp {value}"))),
    }
}
