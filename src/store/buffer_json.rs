//! Binary-safe JSON encoding for credential values.
//!
//! Credential and key material handed over by the engine is arbitrary JSON
//! in which binary payloads appear as `{"type": "Buffer", "data": [..]}`
//! nodes with numeric byte arrays. Naive text serialization keeps those
//! arrays but bloats them and loses the type distinction on some paths, so
//! the store converts `data` to base64 strings on write ([`encode`]) and
//! back to byte arrays on read ([`decode`]). The transform is applied
//! recursively at any nesting depth and round-trips byte-identically.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

const BUFFER_TAG: &str = "Buffer";

fn buffer_payload(map: &serde_json::Map<String, Value>) -> bool {
    map.get("type").and_then(Value::as_str) == Some(BUFFER_TAG) && map.contains_key("data")
}

/// Converts engine-side values (byte arrays) into storage-safe values
/// (base64 strings).
pub fn encode(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            if buffer_payload(&map) {
                let bytes = match map.get("data") {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                        .collect::<Option<Vec<u8>>>(),
                    _ => None,
                };
                if let Some(bytes) = bytes {
                    map.insert("data".to_string(), Value::String(BASE64.encode(bytes)));
                    return Value::Object(map);
                }
            }
            Value::Object(map.into_iter().map(|(k, v)| (k, encode(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(encode).collect()),
        other => other,
    }
}

/// Reverses [`encode`]: base64 `data` strings become numeric byte arrays.
///
/// Untagged or unparseable nodes pass through unchanged, so values written
/// before this adapter existed still load.
pub fn decode(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            if buffer_payload(&map) {
                let bytes = match map.get("data") {
                    Some(Value::String(s)) => BASE64.decode(s).ok(),
                    _ => None,
                };
                if let Some(bytes) = bytes {
                    map.insert(
                        "data".to_string(),
                        Value::Array(bytes.into_iter().map(Value::from).collect()),
                    );
                    return Value::Object(map);
                }
            }
            Value::Object(map.into_iter().map(|(k, v)| (k, decode(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(decode).collect()),
        other => other,
    }
}
