//! Publisher pump
//!
//! Periodically claims PENDING commands from the store, shapes their wire
//! payloads and emits them on the broker. The pump never writes a terminal
//! status: completion belongs to the response correlator, and a failed
//! publish leaves the command PROCESSING for the reaper, so a
//! lost-publish-but-actually-delivered command is not re-sent.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::payload;
use crate::store::models::{Command, CommandType, Reader};
use crate::store::Store;

/// Egress seam between the pump and the broker session
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), GatewayError>;
}

/// Wire envelope published for every command
#[derive(Debug, Serialize)]
pub struct CommandEnvelope<'a> {
    pub command: &'a str,
    pub command_id: &'a str,
    pub payload: Value,
}

/// Periodic worker draining the command queue onto the broker
pub struct PublisherPump {
    store: Store,
    publisher: Arc<dyn CommandPublisher>,
    firmware_url_base: Option<String>,
    interval: Duration,
}

impl PublisherPump {
    pub fn new(
        store: Store,
        publisher: Arc<dyn CommandPublisher>,
        firmware_url_base: Option<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            firmware_url_base,
            interval,
        }
    }

    /// Run until shutdown. Each cycle is idempotent: a restart mid-cycle
    /// leaves claimed commands waiting for correlation or reaping, not
    /// re-published.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Publisher pump started");
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Publisher pump shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("Pump cycle failed: {e}");
                    }
                }
            }
        }
    }

    /// Claim all pending commands and publish each one
    pub async fn run_cycle(&self) -> Result<usize, GatewayError> {
        let claimed = self.store.claim_pending_commands().await?;
        let mut published = 0;

        for command in &claimed {
            let Some(reader) = self.store.reader_by_id(command.reader_id).await? else {
                warn!(
                    "Command {} references missing reader {}; leaving for the reaper",
                    command.command_id, command.reader_id
                );
                continue;
            };

            match self.publish_command(&reader, command).await {
                Ok(()) => {
                    published += 1;
                    debug!(
                        "Published command {} ({}) to reader {}",
                        command.command_id, command.command_type, reader.serial_number
                    );
                }
                Err(e) => {
                    // Left PROCESSING; the reaper will time it out if the
                    // reader never answers.
                    warn!(
                        "Failed to publish command {} to reader {}: {e}",
                        command.command_id, reader.serial_number
                    );
                }
            }
        }

        Ok(published)
    }

    async fn publish_command(
        &self,
        reader: &Reader,
        command: &Command,
    ) -> Result<(), GatewayError> {
        let details = command.details.clone().unwrap_or_else(|| json!({}));

        let wire_payload = match command.command_type {
            CommandType::Mode => payload::normalize_mode_payload(&details),
            CommandType::Upgrade => {
                payload::prepare_upgrade_payload(&details, self.firmware_url_base.as_deref())?
            }
            _ => {
                if details.is_object() {
                    details
                } else {
                    json!({})
                }
            }
        };

        let envelope = CommandEnvelope {
            command: command.command_type.as_str(),
            command_id: &command.command_id,
            payload: wire_payload,
        };

        let topic = format!(
            "smartreader/{}/{}",
            reader.serial_number,
            command.command_type.topic_suffix()
        );

        self.publisher
            .publish(&topic, &serde_json::to_value(&envelope)?)
            .await
    }
}
