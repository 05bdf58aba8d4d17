//! Error types for the SmartReader gateway

use thiserror::Error;

/// Gateway-wide error type
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error("MQTT session is not connected")]
    NotConnected,

    #[error("A connection attempt is already in progress")]
    ConnectInProgress,

    #[error("Publish was not acknowledged within the timeout")]
    PublishTimeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}
