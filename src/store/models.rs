//! Persistent entities of the gateway
//!
//! Readers, commands, events, schedules and alert rules. All timestamps are
//! UTC; JSON payloads are stored as text columns.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;

/// An edge RFID reader, identified by serial number
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Reader {
    pub id: i64,
    pub serial_number: String,
    pub ip_address: String,
    pub location: Option<String>,
    pub enabled: bool,
    pub is_connected: bool,
    pub last_communication: Option<DateTime<Utc>>,
}

/// Command types understood by a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum CommandType {
    Start,
    Stop,
    StatusDetailed,
    Mode,
    Upgrade,
}

impl CommandType {
    /// Topic suffix the command is published on: management commands go to
    /// `manage`, everything else to `control`.
    pub fn topic_suffix(&self) -> &'static str {
        match self {
            CommandType::StatusDetailed | CommandType::Upgrade => "manage",
            _ => "control",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Start => "start",
            CommandType::Stop => "stop",
            CommandType::StatusDetailed => "status-detailed",
            CommandType::Mode => "mode",
            CommandType::Upgrade => "upgrade",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(CommandType::Start),
            "stop" => Ok(CommandType::Stop),
            "status-detailed" => Ok(CommandType::StatusDetailed),
            "mode" => Ok(CommandType::Mode),
            "upgrade" => Ok(CommandType::Upgrade),
            other => Err(GatewayError::InvalidCommand(format!(
                "unknown command type: {other}"
            ))),
        }
    }
}

/// Command lifecycle status. COMPLETED and FAILED are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Processing => "PROCESSING",
            CommandStatus::Completed => "COMPLETED",
            CommandStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(CommandStatus::Pending),
            "PROCESSING" => Ok(CommandStatus::Processing),
            "COMPLETED" => Ok(CommandStatus::Completed),
            "FAILED" => Ok(CommandStatus::Failed),
            other => Err(GatewayError::InvalidCommand(format!(
                "unknown command status: {other}"
            ))),
        }
    }
}

/// A durable intent to make a reader do something
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Command {
    pub id: i64,
    /// Opaque unique identifier used for wire correlation
    pub command_id: String,
    pub reader_id: i64,
    pub command_type: CommandType,
    pub details: Option<Value>,
    pub status: CommandStatus,
    pub response: Option<String>,
    pub date_sent: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single observed tag read. Append-only.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TagEvent {
    pub id: i64,
    pub reader_id: i64,
    pub reader_name: String,
    pub mac_address: String,
    pub epc: String,
    pub first_seen_timestamp: DateTime<Utc>,
    pub antenna_port: i64,
    pub antenna_zone: String,
    pub peak_rssi: f64,
    pub tx_power: f64,
    pub tag_data_key: String,
    pub tag_data_key_name: String,
    pub tag_data_serial: String,
}

/// A health/status event reported by a reader. Append-only.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DetailedStatusEvent {
    pub id: i64,
    pub reader_id: i64,
    pub event_type: String,
    pub component: String,
    pub timestamp: DateTime<Utc>,
    pub mac_address: String,
    pub status: String,
    /// Raw inbound payload
    pub details: Value,
    /// Projection of the payload with antenna noise stripped
    pub non_antenna_details: Value,
}

/// Recurrence of a scheduled command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum Recurrence {
    Once,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    /// Next scheduled time after a firing, advancing from the previous
    /// scheduled time. `None` means the schedule does not repeat.
    pub fn advance(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::Once => None,
            Recurrence::Daily => Some(from + Duration::hours(24)),
            Recurrence::Weekly => Some(from + Duration::days(7)),
            // Calendar-approximate month
            Recurrence::Monthly => Some(from + Duration::days(30)),
        }
    }
}

/// An operator-defined recurring command
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScheduledCommand {
    pub id: i64,
    pub reader_id: i64,
    pub command_type: CommandType,
    pub scheduled_time: DateTime<Utc>,
    pub recurrence: Recurrence,
    pub is_active: bool,
    pub last_run: Option<DateTime<Utc>>,
}

/// An alert rule. Evaluation is outside the gateway core; the schema is kept
/// so operator tooling has a place to store rules.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Alert {
    pub id: i64,
    pub name: String,
    pub condition_type: String,
    pub condition_params: Value,
    pub notification_method: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A recorded firing of an alert rule
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AlertLog {
    pub id: i64,
    pub alert_id: i64,
    pub fired_at: DateTime<Utc>,
    pub details: Option<Value>,
}
