//! Inbound message router
//!
//! Every message the broker session receives is dispatched here by topic
//! suffix: tag reads and status events are appended to the store, result
//! messages are correlated back to their in-flight commands. Messages for
//! unknown readers are logged and dropped without any store write.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::mqtt::IncomingMessage;
use crate::store::models::{CommandStatus, Reader};
use crate::store::{NewStatusEvent, NewTagEvent, Store};

/// Fallback response text when a result message carries neither a response
/// nor a message string
const EMPTY_RESPONSE_TEXT: &str = "No response message";

/// One element of a `tagEvents` message's `tag_reads` array
#[derive(Debug, Deserialize)]
struct TagRead {
    #[serde(default)]
    epc: String,
    #[serde(rename = "firstSeenTimestamp", default)]
    first_seen_timestamp: i64,
    #[serde(rename = "readerName", default)]
    reader_name: String,
    #[serde(default)]
    mac: String,
    #[serde(rename = "antennaPort", default)]
    antenna_port: i64,
    #[serde(rename = "antennaZone", default)]
    antenna_zone: String,
    #[serde(rename = "peakRssi", default)]
    peak_rssi: f64,
    #[serde(rename = "txPower", default)]
    tx_power: f64,
    #[serde(rename = "tagDataKey", default)]
    tag_data_key: String,
    #[serde(rename = "tagDataKeyName", default)]
    tag_data_key_name: String,
    #[serde(rename = "tagDataSerial", default)]
    tag_data_serial: String,
}

/// Routes inbound MQTT messages to typed handlers. Cheap to clone.
#[derive(Clone)]
pub struct InboundRouter {
    store: Store,
}

impl InboundRouter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Drain the session's inbound channel until shutdown. A failing handler
    /// is logged and never takes the worker down.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<IncomingMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Inbound router started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Inbound router shutting down");
                        break;
                    }
                }
                message = rx.recv() => {
                    let Some(message) = message else {
                        info!("Inbound channel closed; router exiting");
                        break;
                    };
                    self.handle_raw(&message.topic, &message.payload).await;
                }
            }
        }
    }

    /// Process one raw message off the broker session
    pub async fn handle_raw(&self, topic: &str, payload: &[u8]) {
        if let Err(e) = self.route_raw(topic, payload).await {
            error!("Error processing message on {topic}: {e}");
        }
    }

    /// The reader lookup and `last_communication` update happen from the
    /// topic alone, so a known reader is marked as heard-from even when its
    /// payload turns out to be malformed; a decode failure is then dropped
    /// without touching command state.
    async fn route_raw(&self, topic: &str, payload: &[u8]) -> Result<bool, GatewayError> {
        let Some((serial, suffix)) = parse_topic(topic) else {
            warn!("Unroutable topic: {topic}");
            return Ok(false);
        };

        let Some(reader) = self.store.touch_last_communication(serial).await? else {
            warn!("No reader found for serial number: {serial}");
            return Ok(false);
        };

        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("Invalid JSON on {topic}: {e}");
                return Ok(false);
            }
        };

        self.dispatch(&reader, suffix, &value).await
    }

    /// Process one decoded message (webhook entry point). Returns `Ok(false)`
    /// when the message was dropped (unknown topic shape, unknown reader,
    /// unmatched command).
    pub async fn process(&self, topic: &str, payload: &Value) -> Result<bool, GatewayError> {
        let Some((serial, suffix)) = parse_topic(topic) else {
            warn!("Unroutable topic: {topic}");
            return Ok(false);
        };

        let Some(reader) = self.store.touch_last_communication(serial).await? else {
            warn!("No reader found for serial number: {serial}");
            return Ok(false);
        };

        self.dispatch(&reader, suffix, payload).await
    }

    /// Route a message for a known reader by topic suffix
    async fn dispatch(
        &self,
        reader: &Reader,
        suffix: &str,
        payload: &Value,
    ) -> Result<bool, GatewayError> {
        match suffix {
            "tagEvents" => self.handle_tag_events(reader, payload).await,
            "event" => {
                if payload.get("smartreader-mqtt-status").and_then(Value::as_str)
                    == Some("connected")
                {
                    self.store.set_reader_connected(reader.id, true).await?;
                }
                self.store_status_event(reader, payload).await
            }
            "lwt" => {
                if payload.get("smartreader-mqtt-status").and_then(Value::as_str)
                    == Some("disconnected")
                {
                    self.store.set_reader_connected(reader.id, false).await?;
                }
                self.store_status_event(reader, payload).await
            }
            "manageResult" | "controlResult" => {
                // The reader was clearly online to reply
                self.store.set_reader_connected(reader.id, true).await?;
                self.handle_command_result(reader, payload).await
            }
            // Reserved; no side effect beyond last_communication
            "metrics" => Ok(true),
            other => {
                warn!(
                    "Unhandled topic suffix '{other}' for reader {}",
                    reader.serial_number
                );
                Ok(false)
            }
        }
    }

    /// Append one TagEvent per element of `tag_reads[]`
    async fn handle_tag_events(
        &self,
        reader: &Reader,
        payload: &Value,
    ) -> Result<bool, GatewayError> {
        let Some(tag_reads) = payload.get("tag_reads").and_then(Value::as_array) else {
            warn!(
                "tagEvents message without tag_reads for reader {}",
                reader.serial_number
            );
            return Ok(false);
        };

        for raw in tag_reads {
            let read: TagRead = match serde_json::from_value(raw.clone()) {
                Ok(read) => read,
                Err(e) => {
                    warn!("Skipping malformed tag read: {e}");
                    continue;
                }
            };

            // firstSeenTimestamp is microseconds since epoch
            let first_seen = DateTime::from_timestamp_micros(read.first_seen_timestamp)
                .unwrap_or_else(Utc::now);

            self.store
                .insert_tag_event(NewTagEvent {
                    reader_id: reader.id,
                    reader_name: read.reader_name,
                    mac_address: read.mac,
                    epc: read.epc.clone(),
                    first_seen_timestamp: first_seen,
                    antenna_port: read.antenna_port,
                    antenna_zone: read.antenna_zone,
                    peak_rssi: read.peak_rssi,
                    tx_power: read.tx_power,
                    tag_data_key: read.tag_data_key,
                    tag_data_key_name: read.tag_data_key_name,
                    tag_data_serial: read.tag_data_serial,
                })
                .await?;
            debug!("Stored tag event for EPC {}", read.epc);
        }

        Ok(true)
    }

    /// Project and append a DetailedStatusEvent
    async fn store_status_event(
        &self,
        reader: &Reader,
        payload: &Value,
    ) -> Result<bool, GatewayError> {
        let (event_type, non_antenna_details) = project_status_event(payload);
        let timestamp = extract_timestamp(payload);

        self.store
            .insert_status_event(NewStatusEvent {
                reader_id: reader.id,
                event_type: event_type.clone(),
                component: payload
                    .get("component")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                timestamp,
                mac_address: payload
                    .get("macAddress")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                status: payload
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                details: payload.clone(),
                non_antenna_details,
            })
            .await?;

        debug!(
            "Stored detailed status event (type: {event_type}) for reader {}",
            reader.serial_number
        );
        Ok(true)
    }

    /// Response correlator: match a result message back to its command and
    /// persist the terminal transition. Unknown or already-terminal commands
    /// are logged and dropped.
    async fn handle_command_result(
        &self,
        reader: &Reader,
        payload: &Value,
    ) -> Result<bool, GatewayError> {
        let command_type = payload
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let Some(command_id) = payload.get("command_id").and_then(Value::as_str) else {
            warn!(
                "Result message without command_id from reader {}",
                reader.serial_number
            );
            return Ok(false);
        };
        let response = payload
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let status = if response == "success" {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };

        let response_text = [response, message]
            .iter()
            .filter(|part| !part.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        let response_text = if response_text.is_empty() {
            EMPTY_RESPONSE_TEXT
        } else {
            &response_text
        };

        info!(
            command_id,
            serial = %reader.serial_number,
            command_type,
            status = %status,
            "Command response received"
        );

        let updated = self
            .store
            .correlate_result(command_id, &reader.serial_number, status, response_text)
            .await?;
        if !updated {
            warn!(
                "Result for unknown or already-terminal command {command_id} from reader {}",
                reader.serial_number
            );
        }
        Ok(updated)
    }
}

/// Split `smartreader/<serial>/<suffix>` into its serial and suffix
fn parse_topic(topic: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["smartreader", serial, suffix] => Some((*serial, *suffix)),
        _ => None,
    }
}

/// Derive the event type and the non-antenna projection for a status payload
fn project_status_event(payload: &Value) -> (String, Value) {
    let empty = Map::new();
    let map = payload.as_object().unwrap_or(&empty);

    let event_type = map
        .get("eventType")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    if event_type == "gpi-status" {
        let configurations = map
            .get("gpiConfigurations")
            .cloned()
            .unwrap_or_else(|| json!([]));
        return (event_type, json!({ "gpiConfigurations": configurations }));
    }

    if let Some(mqtt_status) = map.get("smartreader-mqtt-status") {
        let status = mqtt_status.as_str().unwrap_or_default();
        return ("mqtt-status".to_string(), json!({ "mqtt_status": status }));
    }

    let filtered: Map<String, Value> = if event_type == "status" || event_type == "status-detailed"
    {
        map.iter()
            .filter(|(k, _)| !k.contains("antenna") && k.as_str() != "eventType")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else {
        map.iter()
            .filter(|(k, _)| !k.to_lowercase().contains("antenna"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };

    (event_type, Value::Object(filtered))
}

/// Pull the event timestamp out of a status payload. Integers are
/// microseconds since epoch; strings must be `YYYY-MM-DDTHH:MM:SS.sssZ`.
/// Anything else falls back to the current instant.
fn extract_timestamp(payload: &Value) -> DateTime<Utc> {
    match payload.get("timestamp") {
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_micros)
            .unwrap_or_else(Utc::now),
        Some(Value::String(s)) => NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.fZ")
            .map(|naive| naive.and_utc())
            .unwrap_or_else(|_| Utc::now()),
        _ => Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::CommandType;

    async fn router_with_reader() -> (InboundRouter, Store, Reader) {
        let store = Store::connect_in_memory().await.unwrap();
        let reader = store
            .create_reader("S1", "10.0.0.5", None, true)
            .await
            .unwrap();
        (InboundRouter::new(store.clone()), store, reader)
    }

    #[tokio::test]
    async fn test_unknown_reader_produces_no_writes() {
        let (router, store, _reader) = router_with_reader().await;

        let handled = router
            .process(
                "smartreader/UNKNOWN/event",
                &json!({"eventType": "status", "status": "running"}),
            )
            .await
            .unwrap();

        assert!(!handled);
        assert_eq!(store.status_event_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_still_touches_known_reader() {
        let (router, store, reader) = router_with_reader().await;
        assert!(reader.last_communication.is_none());
        let cmd = store
            .enqueue_command(reader.id, CommandType::Start, None)
            .await
            .unwrap();
        store.claim_pending_commands().await.unwrap();

        router
            .handle_raw("smartreader/S1/controlResult", b"{not json")
            .await;

        // The reader was heard from, even though the payload was garbage
        let reader = store.reader_by_serial("S1").await.unwrap().unwrap();
        assert!(reader.last_communication.is_some());

        // Command state and the event log are untouched
        let stored = store
            .command_by_command_id(&cmd.command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CommandStatus::Processing);
        assert_eq!(store.status_event_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_unknown_reader_writes_nothing() {
        let (router, store, _reader) = router_with_reader().await;

        router.handle_raw("smartreader/NOPE/event", b"{not json").await;

        assert!(store.reader_by_serial("NOPE").await.unwrap().is_none());
        assert_eq!(store.status_event_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tag_events_are_stored() {
        let (router, store, reader) = router_with_reader().await;

        let payload = json!({
            "tag_reads": [
                {
                    "epc": "E28011700000020ABC123456",
                    "firstSeenTimestamp": 1700000000000000i64,
                    "readerName": "dock-a",
                    "mac": "00:16:25:10:9F:AA",
                    "antennaPort": 2,
                    "antennaZone": "inbound",
                    "peakRssi": -54.5,
                    "txPower": 30.0
                },
                { "epc": "E28011700000020ABC999999", "firstSeenTimestamp": 1700000001000000i64 }
            ]
        });

        let handled = router
            .process("smartreader/S1/tagEvents", &payload)
            .await
            .unwrap();
        assert!(handled);

        let events = store.tag_events(reader.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].epc, "E28011700000020ABC123456");
        assert_eq!(events[0].antenna_port, 2);
        assert_eq!(
            events[0].first_seen_timestamp,
            DateTime::from_timestamp_micros(1700000000000000).unwrap()
        );

        // Reader heard from: last_communication updated
        let reader = store.reader_by_serial("S1").await.unwrap().unwrap();
        assert!(reader.last_communication.is_some());
    }

    #[tokio::test]
    async fn test_event_connected_flag() {
        let (router, store, _reader) = router_with_reader().await;

        router
            .process(
                "smartreader/S1/event",
                &json!({"smartreader-mqtt-status": "connected"}),
            )
            .await
            .unwrap();

        let reader = store.reader_by_serial("S1").await.unwrap().unwrap();
        assert!(reader.is_connected);

        let events = store.status_events(reader.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "mqtt-status");
        assert_eq!(events[0].non_antenna_details["mqtt_status"], "connected");
    }

    #[tokio::test]
    async fn test_lwt_disconnects_reader() {
        let (router, store, reader) = router_with_reader().await;
        store.set_reader_connected(reader.id, true).await.unwrap();

        router
            .process(
                "smartreader/S1/lwt",
                &json!({"smartreader-mqtt-status": "disconnected"}),
            )
            .await
            .unwrap();

        let reader = store.reader_by_serial("S1").await.unwrap().unwrap();
        assert!(!reader.is_connected);
        assert_eq!(store.status_event_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_result_completes_command() {
        let (router, store, reader) = router_with_reader().await;
        let cmd = store
            .enqueue_command(reader.id, CommandType::Start, None)
            .await
            .unwrap();
        store.claim_pending_commands().await.unwrap();

        let handled = router
            .process(
                "smartreader/S1/controlResult",
                &json!({
                    "command": "start",
                    "command_id": cmd.command_id,
                    "response": "success",
                    "message": ""
                }),
            )
            .await
            .unwrap();
        assert!(handled);

        let stored = store
            .command_by_command_id(&cmd.command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
        assert_eq!(stored.response.as_deref(), Some("success"));

        // Replying proves the reader is online
        let reader = store.reader_by_serial("S1").await.unwrap().unwrap();
        assert!(reader.is_connected);
    }

    #[tokio::test]
    async fn test_result_failure_keeps_reader_message() {
        let (router, store, reader) = router_with_reader().await;
        let cmd = store
            .enqueue_command(reader.id, CommandType::Mode, None)
            .await
            .unwrap();
        store.claim_pending_commands().await.unwrap();

        router
            .process(
                "smartreader/S1/manageResult",
                &json!({
                    "command": "mode",
                    "command_id": cmd.command_id,
                    "response": "error",
                    "message": "unsupported antenna"
                }),
            )
            .await
            .unwrap();

        let stored = store
            .command_by_command_id(&cmd.command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CommandStatus::Failed);
        assert_eq!(stored.response.as_deref(), Some("error unsupported antenna"));
    }

    #[tokio::test]
    async fn test_unknown_command_id_is_dropped() {
        let (router, _store, _reader) = router_with_reader().await;

        let handled = router
            .process(
                "smartreader/S1/controlResult",
                &json!({"command": "start", "command_id": "nope", "response": "success"}),
            )
            .await
            .unwrap();
        assert!(!handled);
    }

    #[tokio::test]
    async fn test_late_duplicate_result_is_ignored() {
        let (router, store, reader) = router_with_reader().await;
        let cmd = store
            .enqueue_command(reader.id, CommandType::Start, None)
            .await
            .unwrap();
        store.claim_pending_commands().await.unwrap();

        let result = json!({
            "command": "start",
            "command_id": cmd.command_id,
            "response": "success"
        });
        assert!(router
            .process("smartreader/S1/controlResult", &result)
            .await
            .unwrap());

        // A late failure duplicate must not overwrite the terminal status
        let late = json!({
            "command": "start",
            "command_id": cmd.command_id,
            "response": "error",
            "message": "late"
        });
        assert!(!router
            .process("smartreader/S1/controlResult", &late)
            .await
            .unwrap());

        let stored = store
            .command_by_command_id(&cmd.command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
    }

    #[tokio::test]
    async fn test_empty_response_gets_placeholder() {
        let (router, store, reader) = router_with_reader().await;
        let cmd = store
            .enqueue_command(reader.id, CommandType::Stop, None)
            .await
            .unwrap();
        store.claim_pending_commands().await.unwrap();

        router
            .process(
                "smartreader/S1/controlResult",
                &json!({"command": "stop", "command_id": cmd.command_id, "response": ""}),
            )
            .await
            .unwrap();

        let stored = store
            .command_by_command_id(&cmd.command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CommandStatus::Failed);
        assert_eq!(stored.response.as_deref(), Some("No response message"));
    }

    #[test]
    fn test_gpi_status_projection() {
        let payload = json!({
            "eventType": "gpi-status",
            "gpiConfigurations": [{"gpi": 1, "state": "high"}],
            "antennaPort": 1
        });
        let (event_type, details) = project_status_event(&payload);
        assert_eq!(event_type, "gpi-status");
        assert_eq!(details["gpiConfigurations"][0]["gpi"], 1);
        assert!(details.get("antennaPort").is_none());
    }

    #[test]
    fn test_status_projection_strips_antenna_keys() {
        let payload = json!({
            "eventType": "status-detailed",
            "status": "running",
            "antennaStates": [1, 2],
            "nonAntennaField": "kept",
            "Antenna": "kept-case-sensitive"
        });
        let (event_type, details) = project_status_event(&payload);
        assert_eq!(event_type, "status-detailed");
        assert_eq!(details["status"], "running");
        assert_eq!(details["nonAntennaField"], "kept");
        // status/status-detailed filtering is case-sensitive
        assert_eq!(details["Antenna"], "kept-case-sensitive");
        assert!(details.get("antennaStates").is_none());
        assert!(details.get("eventType").is_none());
    }

    #[test]
    fn test_other_projection_is_case_insensitive() {
        let payload = json!({
            "eventType": "inventory-status",
            "AntennaPort": 3,
            "temperature": 41
        });
        let (event_type, details) = project_status_event(&payload);
        assert_eq!(event_type, "inventory-status");
        assert!(details.get("AntennaPort").is_none());
        assert_eq!(details["temperature"], 41);
        assert_eq!(details["eventType"], "inventory-status");
    }

    #[test]
    fn test_timestamp_extraction() {
        let micros = json!({"timestamp": 1700000000000000i64});
        assert_eq!(
            extract_timestamp(&micros),
            DateTime::from_timestamp_micros(1700000000000000).unwrap()
        );

        let iso = json!({"timestamp": "2024-01-02T03:04:05.678Z"});
        let extracted = extract_timestamp(&iso);
        assert_eq!(
            extracted,
            NaiveDateTime::parse_from_str("2024-01-02T03:04:05.678Z", "%Y-%m-%dT%H:%M:%S%.fZ")
                .unwrap()
                .and_utc()
        );

        // Garbage falls back to roughly now
        let bad = json!({"timestamp": "yesterday"});
        let now = Utc::now();
        let extracted = extract_timestamp(&bad);
        assert!((extracted - now).num_seconds().abs() < 5);
    }
}
