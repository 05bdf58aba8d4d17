//! HTTP ingress
//!
//! The externally facing surface of the command lifecycle: command
//! submission, the pending-poll used by an out-of-process pump, status
//! updates from sidecar workers, the inbound-event webhook, and session
//! diagnostics. Every request must carry a valid `X-API-Key` header.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::mqtt::BrokerSession;
use crate::payload;
use crate::router::InboundRouter;
use crate::store::models::{Command, CommandStatus, CommandType};
use crate::store::Store;

/// Shared state behind every handler
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub inbound: InboundRouter,
    pub session: Option<Arc<BrokerSession>>,
    pub api_key: Option<String>,
}

/// Build the ingress router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/commands/", post(create_command))
        .route("/api/commands/pending/", get(pending_commands))
        .route("/api/commands/{command_id}/status/", put(update_command_status))
        .route("/api/mqtt/process/", post(process_mqtt_message))
        .route("/api/mqtt/diagnostics/", get(mqtt_diagnostics))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

/// Reject requests without the shared API key. The body stays opaque.
async fn require_api_key(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());

    let Some(expected) = state.api_key.as_deref() else {
        warn!("API request rejected: no API key configured");
        return unauthorized("API key not configured");
    };

    match provided {
        Some(key) if key == expected => next.run(request).await,
        Some(_) => {
            warn!("API request with invalid API key");
            unauthorized("Invalid API key")
        }
        None => {
            warn!("API request without API key");
            unauthorized("API key is missing")
        }
    }
}

fn unauthorized(reason: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": reason }))).into_response()
}

#[derive(Debug, Deserialize)]
struct CreateCommandRequest {
    reader_serial_number: String,
    command_type: String,
    details: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct UpdateStatusRequest {
    status: String,
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProcessMessageRequest {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    data: Value,
}

/// POST /api/commands/: validate and enqueue a command as PENDING
async fn create_command(
    State(state): State<ApiState>,
    Json(request): Json<CreateCommandRequest>,
) -> Response {
    let command_type: CommandType = match request.command_type.parse() {
        Ok(parsed) => parsed,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                .into_response()
        }
    };

    let reader = match state
        .store
        .reader_by_serial(&request.reader_serial_number)
        .await
    {
        Ok(Some(reader)) => reader,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Reader not found" })),
            )
                .into_response()
        }
        Err(e) => return store_error(e),
    };

    // Upgrade payloads must be complete before they are accepted
    if command_type == CommandType::Upgrade {
        let details = request.details.clone().unwrap_or(Value::Null);
        if let Err(e) = payload::prepare_upgrade_payload(&details, None) {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                .into_response();
        }
    }

    match state
        .store
        .enqueue_command(reader.id, command_type, request.details)
        .await
    {
        Ok(command) => {
            info!(
                "Command accepted: {} {} for reader {}",
                command.command_id, command.command_type, reader.serial_number
            );
            (
                StatusCode::CREATED,
                Json(command_repr(&command, &reader.serial_number)),
            )
                .into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
            .into_response(),
    }
}

/// GET /api/commands/pending/: atomically claim all PENDING commands.
/// The claim happens store-side so an external pump polling this endpoint
/// observes the same semantics as the in-process pump.
async fn pending_commands(State(state): State<ApiState>) -> Response {
    let claimed = match state.store.claim_pending_commands().await {
        Ok(claimed) => claimed,
        Err(e) => return store_error(e),
    };

    let mut body = Vec::with_capacity(claimed.len());
    for command in &claimed {
        let serial = match state.store.reader_by_id(command.reader_id).await {
            Ok(Some(reader)) => reader.serial_number,
            _ => String::new(),
        };
        body.push(command_repr(command, &serial));
    }

    (StatusCode::OK, Json(Value::Array(body))).into_response()
}

/// PUT /api/commands/{command_id}/status/: status update from a sidecar
/// worker. Terminal statuses are never overwritten.
async fn update_command_status(
    State(state): State<ApiState>,
    Path(command_id): Path<String>,
    Json(request): Json<UpdateStatusRequest>,
) -> Response {
    let status: CommandStatus = match request.status.parse() {
        Ok(parsed) => parsed,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                .into_response()
        }
    };

    match state.store.command_by_command_id(&command_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Command not found" })),
            )
                .into_response()
        }
        Err(e) => return store_error(e),
    }

    match state
        .store
        .update_command_status(&command_id, status, request.response.as_deref())
        .await
    {
        Ok(true) => {
            let command = state.store.command_by_command_id(&command_id).await;
            match command {
                Ok(Some(command)) => {
                    let serial = state
                        .store
                        .reader_by_id(command.reader_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|r| r.serial_number)
                        .unwrap_or_default();
                    (StatusCode::OK, Json(command_repr(&command, &serial))).into_response()
                }
                _ => StatusCode::OK.into_response(),
            }
        }
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "Command is already in a terminal state" })),
        )
            .into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /api/mqtt/process/: hand an externally received message to the
/// inbound router, exactly as if it had arrived on the broker session.
async fn process_mqtt_message(
    State(state): State<ApiState>,
    Json(request): Json<ProcessMessageRequest>,
) -> Response {
    if request.topic.is_empty() || request.data.is_null() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Both topic and payload are required" })),
        )
            .into_response();
    }

    match state.inbound.process(&request.topic, &request.data).await {
        Ok(true) => (StatusCode::OK, Json(json!({ "status": "success" }))).into_response(),
        Ok(false) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Failed to process message" })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("Internal server error: {e}") })),
        )
            .into_response(),
    }
}

/// GET /api/mqtt/diagnostics/: broker session health snapshot
async fn mqtt_diagnostics(State(state): State<ApiState>) -> Response {
    match &state.session {
        Some(session) => {
            let diagnostics = session.diagnostics().await;
            (StatusCode::OK, Json(json!(diagnostics))).into_response()
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "MQTT session not initialized" })),
        )
            .into_response(),
    }
}

fn store_error(e: crate::error::GatewayError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

fn command_repr(command: &Command, reader_serial: &str) -> Value {
    json!({
        "command_id": command.command_id,
        "reader_serial_number": reader_serial,
        "command_type": command.command_type,
        "details": command.details,
        "status": command.status,
        "response": command.response,
        "date_sent": command.date_sent,
        "updated_at": command.updated_at,
    })
}
