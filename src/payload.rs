//! Outbound command payload shaping
//!
//! Readers reject `mode` payloads carrying empty values, so those are
//! stripped before publish. Firmware upgrade payloads are validated and get
//! the configured URL prefix applied.

use serde_json::{json, Map, Value};

use crate::error::GatewayError;

/// RSSI filter threshold applied when the operator did not choose one
pub const DEFAULT_RSSI_THRESHOLD: i64 = -92;

/// Keys a firmware upgrade payload must carry
const UPGRADE_REQUIRED_KEYS: [&str; 3] = ["url", "timeoutInMinutes", "maxRetries"];

/// Normalize a `mode` payload: recursively drop empty values, then make sure
/// `rssiFilter.threshold` is set. Applying this to an already-clean payload
/// is a no-op.
pub fn normalize_mode_payload(details: &Value) -> Value {
    let mut map = match clean_empty(details) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let rssi_filter = map.entry("rssiFilter").or_insert_with(|| json!({}));
    if let Some(filter) = rssi_filter.as_object_mut() {
        let needs_default = match filter.get("threshold") {
            None => true,
            Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if needs_default {
            filter.insert("threshold".to_string(), json!(DEFAULT_RSSI_THRESHOLD));
        }
    }

    Value::Object(map)
}

/// Recursively remove keys whose value is empty: empty string, null, empty
/// list, empty map. Returns `None` when the value itself is empty.
fn clean_empty(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .iter()
                .filter_map(|(k, v)| clean_empty(v).map(|v| (k.clone(), v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        Value::Array(items) => {
            if items.is_empty() {
                None
            } else {
                Some(Value::Array(
                    items.iter().filter_map(clean_empty).collect(),
                ))
            }
        }
        other => Some(other.clone()),
    }
}

/// Validate an `upgrade` payload and apply the firmware URL prefix. The
/// reader needs `url`, `timeoutInMinutes` and `maxRetries` to run a
/// firmware download.
pub fn prepare_upgrade_payload(
    details: &Value,
    firmware_url_base: Option<&str>,
) -> Result<Value, GatewayError> {
    let map = details.as_object().ok_or_else(|| {
        GatewayError::InvalidCommand("upgrade command requires a payload object".to_string())
    })?;

    for key in UPGRADE_REQUIRED_KEYS {
        if !map.contains_key(key) {
            return Err(GatewayError::InvalidCommand(format!(
                "upgrade payload is missing required field '{key}'"
            )));
        }
    }

    let mut payload = map.clone();
    if let Some(base) = firmware_url_base {
        if let Some(Value::String(url)) = payload.get("url") {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                let prefixed = format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/'));
                payload.insert("url".to_string(), Value::String(prefixed));
            }
        }
    }

    Ok(Value::Object(payload))
}
