use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::CommandStatus;

/// Transport-level failure of the push channel. Always triggers a reconnect.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("no pong within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("server closed the connection")]
    Closed,

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure of `ConnectionManager::send`. The caller owns retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("push channel is not connected")]
    NotConnected,

    #[error("push channel outbound buffer is full")]
    BufferFull,
}

/// Command rejected at admission; never reaches the network.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("selector '{selector}' matches no known agent")]
    EmptyTargets { selector: String },

    #[error("invalid target selector '{0}'")]
    InvalidSelector(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("command '{command}' takes no parameters")]
    UnexpectedPayload { command: String },

    #[error("malformed parameters for '{command}': {reason}")]
    MalformedParameters { command: String, reason: String },

    #[error("invalid {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },
}

/// Per-target delivery failure. Isolated to that target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent rejected command: {0}")]
    Rejected(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("interrupted by shutdown")]
    Interrupted,
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Rejected(_))
    }
}

/// An update older than what the store already holds. Dropped and logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stale {entity}: incoming {incoming} is older than stored {stored}")]
pub struct StaleDataError {
    pub entity: String,
    pub incoming: DateTime<Utc>,
    pub stored: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("command {0} not found")]
    NotFound(Uuid),

    #[error("command {id} is {status} and can no longer be cancelled")]
    NotCancellable { id: Uuid, status: CommandStatus },
}

/// HTTP collaborator failure.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend rejected request: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// HTTP mapping for the operator API
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Validation(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };

        (
            status,
            Json(ErrorBody {
                success: false,
                error: message,
            }),
        )
            .into_response()
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::NotFound(_) => AppError::NotFound(e.to_string()),
            QueueError::NotCancellable { .. } => AppError::Conflict(e.to_string()),
        }
    }
}
