//! Durable store for readers, commands, events, schedules and alerts
//!
//! Backed by SQLite via sqlx. Every state transition is a single statement;
//! command claims and terminal transitions are guarded by the current status
//! so concurrent workers cannot double-claim or overwrite a terminal value.

pub mod models;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::GatewayError;
use models::{
    Command, CommandStatus, CommandType, DetailedStatusEvent, Reader, Recurrence,
    ScheduledCommand, TagEvent,
};

/// Schema applied at startup. Idempotent.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS readers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    serial_number TEXT NOT NULL UNIQUE,
    ip_address TEXT NOT NULL,
    location TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    is_connected INTEGER NOT NULL DEFAULT 0,
    last_communication TEXT
);

CREATE TABLE IF NOT EXISTS commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    command_id TEXT NOT NULL UNIQUE,
    reader_id INTEGER NOT NULL REFERENCES readers(id) ON DELETE CASCADE,
    command_type TEXT NOT NULL,
    details TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING',
    response TEXT,
    date_sent TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_commands_status ON commands(status, date_sent);

CREATE TABLE IF NOT EXISTS tag_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reader_id INTEGER NOT NULL REFERENCES readers(id) ON DELETE CASCADE,
    reader_name TEXT NOT NULL DEFAULT '',
    mac_address TEXT NOT NULL DEFAULT '',
    epc TEXT NOT NULL,
    first_seen_timestamp TEXT NOT NULL,
    antenna_port INTEGER NOT NULL DEFAULT 0,
    antenna_zone TEXT NOT NULL DEFAULT '',
    peak_rssi REAL NOT NULL DEFAULT 0,
    tx_power REAL NOT NULL DEFAULT 0,
    tag_data_key TEXT NOT NULL DEFAULT '',
    tag_data_key_name TEXT NOT NULL DEFAULT '',
    tag_data_serial TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_tag_events_reader ON tag_events(reader_id, first_seen_timestamp);

CREATE TABLE IF NOT EXISTS detailed_status_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reader_id INTEGER NOT NULL REFERENCES readers(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    component TEXT NOT NULL DEFAULT 'unknown',
    timestamp TEXT NOT NULL,
    mac_address TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT '',
    details TEXT NOT NULL,
    non_antenna_details TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_status_events_reader ON detailed_status_events(reader_id, timestamp);

CREATE TABLE IF NOT EXISTS scheduled_commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reader_id INTEGER NOT NULL REFERENCES readers(id) ON DELETE CASCADE,
    command_type TEXT NOT NULL,
    scheduled_time TEXT NOT NULL,
    recurrence TEXT NOT NULL DEFAULT 'ONCE',
    is_active INTEGER NOT NULL DEFAULT 1,
    last_run TEXT
);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    condition_type TEXT NOT NULL,
    condition_params TEXT NOT NULL,
    notification_method TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alert_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_id INTEGER NOT NULL REFERENCES alerts(id) ON DELETE CASCADE,
    fired_at TEXT NOT NULL,
    details TEXT
);
"#;

/// New tag event, as parsed from a `tagEvents` message
#[derive(Debug, Clone)]
pub struct NewTagEvent {
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

/// New detailed status event, as projected from an `event`/`lwt` message
#[derive(Debug, Clone)]
pub struct NewStatusEvent {
    pub reader_id: i64,
    pub event_type: String,
    pub component: String,
    pub timestamp: DateTime<Utc>,
    pub mac_address: String,
    pub status: String,
    pub details: Value,
    pub non_antenna_details: Value,
}

/// Handle to the durable store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if necessary) the database and apply the schema
    pub async fn connect(database_url: &str) -> Result<Self, GatewayError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(GatewayError::Store)?
            .create_if_missing(true)
            .foreign_keys(true);

        // In-memory databases exist per connection; pin the pool to one.
        let in_memory = database_url.contains(":memory:");
        let max_connections = if in_memory { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .min_connections(if in_memory { 1 } else { 0 })
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Store initialized at {}", database_url);
        Ok(store)
    }

    /// In-memory store for tests
    pub async fn connect_in_memory() -> Result<Self, GatewayError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), GatewayError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    // === Readers ===

    pub async fn create_reader(
        &self,
        serial_number: &str,
        ip_address: &str,
        location: Option<&str>,
        enabled: bool,
    ) -> Result<Reader, GatewayError> {
        let id = sqlx::query(
            "INSERT INTO readers (serial_number, ip_address, location, enabled) VALUES (?, ?, ?, ?)",
        )
        .bind(serial_number)
        .bind(ip_address)
        .bind(location)
        .bind(enabled)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.reader_by_id(id)
            .await?
            .ok_or_else(|| GatewayError::ReaderNotFound(serial_number.to_string()))
    }

    pub async fn reader_by_id(&self, id: i64) -> Result<Option<Reader>, GatewayError> {
        let reader = sqlx::query_as::<_, Reader>("SELECT * FROM readers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(reader)
    }

    pub async fn reader_by_serial(&self, serial: &str) -> Result<Option<Reader>, GatewayError> {
        let reader = sqlx::query_as::<_, Reader>("SELECT * FROM readers WHERE serial_number = ?")
            .bind(serial)
            .fetch_optional(&self.pool)
            .await?;
        Ok(reader)
    }

    /// Record that a reader was heard from. Returns the reader, or `None`
    /// (and writes nothing) when the serial is unknown.
    pub async fn touch_last_communication(
        &self,
        serial: &str,
    ) -> Result<Option<Reader>, GatewayError> {
        let updated =
            sqlx::query("UPDATE readers SET last_communication = ? WHERE serial_number = ?")
                .bind(Utc::now())
                .bind(serial)
                .execute(&self.pool)
                .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.reader_by_serial(serial).await
    }

    pub async fn set_reader_connected(
        &self,
        reader_id: i64,
        connected: bool,
    ) -> Result<(), GatewayError> {
        sqlx::query("UPDATE readers SET is_connected = ? WHERE id = ?")
            .bind(connected)
            .bind(reader_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // === Commands ===

    /// Create a new PENDING command with a generated identifier
    pub async fn enqueue_command(
        &self,
        reader_id: i64,
        command_type: CommandType,
        details: Option<Value>,
    ) -> Result<Command, GatewayError> {
        let command_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO commands (command_id, reader_id, command_type, details, status, date_sent, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&command_id)
        .bind(reader_id)
        .bind(command_type)
        .bind(details)
        .bind(CommandStatus::Pending)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.command_by_command_id(&command_id)
            .await?
            .ok_or_else(|| {
                GatewayError::InvalidCommand(format!("command {command_id} vanished after insert"))
            })
    }

    pub async fn command_by_command_id(
        &self,
        command_id: &str,
    ) -> Result<Option<Command>, GatewayError> {
        let command = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE command_id = ?")
            .bind(command_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(command)
    }

    /// Claim every PENDING command, oldest first, transitioning each to
    /// PROCESSING. The per-row status guard means a concurrent claimer gets
    /// disjoint sets; a command is never handed out twice.
    pub async fn claim_pending_commands(&self) -> Result<Vec<Command>, GatewayError> {
        let mut pending = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE status = ?")
            .bind(CommandStatus::Pending)
            .fetch_all(&self.pool)
            .await?;
        pending.sort_by_key(|c| c.date_sent);

        let mut claimed = Vec::new();
        for mut command in pending {
            let now = Utc::now();
            let result = sqlx::query(
                "UPDATE commands SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(CommandStatus::Processing)
            .bind(now)
            .bind(command.id)
            .bind(CommandStatus::Pending)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                command.status = CommandStatus::Processing;
                command.updated_at = now;
                claimed.push(command);
            }
        }

        if !claimed.is_empty() {
            debug!("Claimed {} pending command(s)", claimed.len());
        }
        Ok(claimed)
    }

    /// Move a command to a new status unless it is already terminal.
    /// Returns whether a row changed.
    pub async fn update_command_status(
        &self,
        command_id: &str,
        status: CommandStatus,
        response: Option<&str>,
    ) -> Result<bool, GatewayError> {
        let result = sqlx::query(
            "UPDATE commands SET status = ?, response = ?, updated_at = ? \
             WHERE command_id = ? AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(status)
        .bind(response)
        .bind(Utc::now())
        .bind(command_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Correlate a reader's result message with its in-flight command. The
    /// reader serial must match the command's reader; already-terminal
    /// commands are left untouched.
    pub async fn correlate_result(
        &self,
        command_id: &str,
        reader_serial: &str,
        status: CommandStatus,
        response: &str,
    ) -> Result<bool, GatewayError> {
        let result = sqlx::query(
            "UPDATE commands SET status = ?, response = ?, updated_at = ? \
             WHERE command_id = ? \
               AND reader_id = (SELECT id FROM readers WHERE serial_number = ?) \
               AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(status)
        .bind(response)
        .bind(Utc::now())
        .bind(command_id)
        .bind(reader_serial)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fail every PROCESSING command not updated since `cutoff`. The status
    /// guard lets a racing correlator win; only one terminal write persists.
    pub async fn reap_stale_commands(
        &self,
        cutoff: DateTime<Utc>,
        response: &str,
    ) -> Result<u64, GatewayError> {
        let processing = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE status = ?")
            .bind(CommandStatus::Processing)
            .fetch_all(&self.pool)
            .await?;

        let mut reaped = 0u64;
        for command in processing.into_iter().filter(|c| c.updated_at < cutoff) {
            let result = sqlx::query(
                "UPDATE commands SET status = ?, response = ?, updated_at = ? \
                 WHERE id = ? AND status = ?",
            )
            .bind(CommandStatus::Failed)
            .bind(response)
            .bind(Utc::now())
            .bind(command.id)
            .bind(CommandStatus::Processing)
            .execute(&self.pool)
            .await?;
            reaped += result.rows_affected();
        }
        Ok(reaped)
    }

    // === Events ===

    pub async fn insert_tag_event(&self, event: NewTagEvent) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO tag_events (reader_id, reader_name, mac_address, epc, first_seen_timestamp, \
             antenna_port, antenna_zone, peak_rssi, tx_power, tag_data_key, tag_data_key_name, tag_data_serial) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.reader_id)
        .bind(event.reader_name)
        .bind(event.mac_address)
        .bind(event.epc)
        .bind(event.first_seen_timestamp)
        .bind(event.antenna_port)
        .bind(event.antenna_zone)
        .bind(event.peak_rssi)
        .bind(event.tx_power)
        .bind(event.tag_data_key)
        .bind(event.tag_data_key_name)
        .bind(event.tag_data_serial)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_status_event(&self, event: NewStatusEvent) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO detailed_status_events (reader_id, event_type, component, timestamp, \
             mac_address, status, details, non_antenna_details) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.reader_id)
        .bind(event.event_type)
        .bind(event.component)
        .bind(event.timestamp)
        .bind(event.mac_address)
        .bind(event.status)
        .bind(event.details)
        .bind(event.non_antenna_details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn tag_events(&self, reader_id: i64) -> Result<Vec<TagEvent>, GatewayError> {
        let events = sqlx::query_as::<_, TagEvent>(
            "SELECT * FROM tag_events WHERE reader_id = ? ORDER BY id",
        )
        .bind(reader_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn status_events(
        &self,
        reader_id: i64,
    ) -> Result<Vec<DetailedStatusEvent>, GatewayError> {
        let events = sqlx::query_as::<_, DetailedStatusEvent>(
            "SELECT * FROM detailed_status_events WHERE reader_id = ? ORDER BY id",
        )
        .bind(reader_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn status_event_count(&self) -> Result<i64, GatewayError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM detailed_status_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    // === Scheduled commands ===

    pub async fn create_schedule(
        &self,
        reader_id: i64,
        command_type: CommandType,
        scheduled_time: DateTime<Utc>,
        recurrence: Recurrence,
    ) -> Result<ScheduledCommand, GatewayError> {
        let id = sqlx::query(
            "INSERT INTO scheduled_commands (reader_id, command_type, scheduled_time, recurrence) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(reader_id)
        .bind(command_type)
        .bind(scheduled_time)
        .bind(recurrence)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.schedule_by_id(id).await?.ok_or_else(|| {
            GatewayError::InvalidCommand(format!("schedule {id} vanished after insert"))
        })
    }

    pub async fn schedule_by_id(
        &self,
        id: i64,
    ) -> Result<Option<ScheduledCommand>, GatewayError> {
        let schedule =
            sqlx::query_as::<_, ScheduledCommand>("SELECT * FROM scheduled_commands WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(schedule)
    }

    /// Active schedules whose scheduled time has passed
    pub async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledCommand>, GatewayError> {
        let schedules = sqlx::query_as::<_, ScheduledCommand>(
            "SELECT * FROM scheduled_commands WHERE is_active = 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules
            .into_iter()
            .filter(|s| s.scheduled_time <= now)
            .collect())
    }

    /// Record a firing: set `last_run` and either advance `scheduled_time`
    /// or deactivate a one-shot schedule.
    pub async fn complete_schedule_run(
        &self,
        id: i64,
        last_run: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<(), GatewayError> {
        match next {
            Some(next_time) => {
                sqlx::query(
                    "UPDATE scheduled_commands SET last_run = ?, scheduled_time = ? WHERE id = ?",
                )
                .bind(last_run)
                .bind(next_time)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE scheduled_commands SET last_run = ?, is_active = 0 WHERE id = ?",
                )
                .bind(last_run)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with_reader() -> (Store, Reader) {
        let store = Store::connect_in_memory().await.unwrap();
        let reader = store
            .create_reader("S1", "10.0.0.5", Some("dock-a"), true)
            .await
            .unwrap();
        (store, reader)
    }

    #[tokio::test]
    async fn test_enqueue_and_claim() {
        let (store, reader) = store_with_reader().await;

        let first = store
            .enqueue_command(reader.id, CommandType::Start, None)
            .await
            .unwrap();
        let second = store
            .enqueue_command(reader.id, CommandType::Stop, None)
            .await
            .unwrap();
        assert_eq!(first.status, CommandStatus::Pending);
        assert_ne!(first.command_id, second.command_id);

        let claimed = store.claim_pending_commands().await.unwrap();
        assert_eq!(claimed.len(), 2);
        // Oldest first
        assert_eq!(claimed[0].command_id, first.command_id);
        assert!(claimed.iter().all(|c| c.status == CommandStatus::Processing));

        // A second claim finds nothing: no double-claim
        let again = store.claim_pending_commands().await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_status_is_absorbing() {
        let (store, reader) = store_with_reader().await;
        let cmd = store
            .enqueue_command(reader.id, CommandType::Start, None)
            .await
            .unwrap();

        assert!(store
            .update_command_status(&cmd.command_id, CommandStatus::Completed, Some("success"))
            .await
            .unwrap());

        // A late FAILED write must not stick
        assert!(!store
            .update_command_status(&cmd.command_id, CommandStatus::Failed, Some("late"))
            .await
            .unwrap());

        let stored = store
            .command_by_command_id(&cmd.command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
        assert_eq!(stored.response.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn test_correlate_requires_matching_reader() {
        let (store, reader) = store_with_reader().await;
        store
            .create_reader("S2", "10.0.0.6", None, true)
            .await
            .unwrap();
        let cmd = store
            .enqueue_command(reader.id, CommandType::Start, None)
            .await
            .unwrap();

        // Result arriving on the wrong reader's topic does not correlate
        assert!(!store
            .correlate_result(&cmd.command_id, "S2", CommandStatus::Completed, "success")
            .await
            .unwrap());
        assert!(store
            .correlate_result(&cmd.command_id, "S1", CommandStatus::Completed, "success")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_reap_only_touches_stale_processing() {
        let (store, reader) = store_with_reader().await;
        let cmd = store
            .enqueue_command(reader.id, CommandType::Start, None)
            .await
            .unwrap();

        // PENDING commands are never reaped
        let reaped = store
            .reap_stale_commands(Utc::now() + chrono::Duration::seconds(60), "timed out")
            .await
            .unwrap();
        assert_eq!(reaped, 0);

        store.claim_pending_commands().await.unwrap();

        // Not yet stale
        let reaped = store
            .reap_stale_commands(Utc::now() - chrono::Duration::seconds(30), "timed out")
            .await
            .unwrap();
        assert_eq!(reaped, 0);

        // Stale now
        let reaped = store
            .reap_stale_commands(Utc::now() + chrono::Duration::seconds(1), "timed out")
            .await
            .unwrap();
        assert_eq!(reaped, 1);

        let stored = store
            .command_by_command_id(&cmd.command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CommandStatus::Failed);
        assert_eq!(stored.response.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_touch_unknown_serial_writes_nothing() {
        let (store, _reader) = store_with_reader().await;
        let missing = store.touch_last_communication("NOPE").await.unwrap();
        assert!(missing.is_none());

        let touched = store.touch_last_communication("S1").await.unwrap().unwrap();
        assert!(touched.last_communication.is_some());
    }

    #[tokio::test]
    async fn test_schedule_lifecycle() {
        let (store, reader) = store_with_reader().await;
        let due_at = Utc::now() - chrono::Duration::seconds(1);
        let schedule = store
            .create_schedule(reader.id, CommandType::Stop, due_at, Recurrence::Daily)
            .await
            .unwrap();

        let due = store.due_schedules(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);

        let now = Utc::now();
        let next = schedule.recurrence.advance(schedule.scheduled_time);
        store
            .complete_schedule_run(schedule.id, now, next)
            .await
            .unwrap();

        let updated = store.schedule_by_id(schedule.id).await.unwrap().unwrap();
        assert!(updated.is_active);
        assert_eq!(
            updated.scheduled_time,
            schedule.scheduled_time + chrono::Duration::hours(24)
        );
        assert_eq!(updated.last_run, Some(now));

        // One-shot schedules deactivate instead of advancing
        let once = store
            .create_schedule(reader.id, CommandType::Start, due_at, Recurrence::Once)
            .await
            .unwrap();
        store
            .complete_schedule_run(once.id, now, None)
            .await
            .unwrap();
        let once = store.schedule_by_id(once.id).await.unwrap().unwrap();
        assert!(!once.is_active);
    }

    #[tokio::test]
    async fn test_events_are_appended() {
        let (store, reader) = store_with_reader().await;
        store
            .insert_status_event(NewStatusEvent {
                reader_id: reader.id,
                event_type: "mqtt-status".into(),
                component: "unknown".into(),
                timestamp: Utc::now(),
                mac_address: String::new(),
                status: String::new(),
                details: json!({"smartreader-mqtt-status": "connected"}),
                non_antenna_details: json!({"mqtt_status": "connected"}),
            })
            .await
            .unwrap();

        assert_eq!(store.status_event_count().await.unwrap(), 1);
        let events = store.status_events(reader.id).await.unwrap();
        assert_eq!(events[0].event_type, "mqtt-status");
        assert_eq!(events[0].non_antenna_details["mqtt_status"], "connected");
    }
}
