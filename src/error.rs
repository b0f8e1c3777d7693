//! Error handling for watchpost

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Frame adapter could not be opened (fatal to the start attempt)
    #[error("Source unavailable: {source_id}: {message}")]
    SourceUnavailable { source_id: String, message: String },

    /// A worker is already running for this source
    #[error("Stream already active: {0}")]
    StreamAlreadyActive(String),

    /// No worker is running for this source
    #[error("Stream not active: {0}")]
    StreamNotActive(String),

    /// Source id is not registered in the ConfigStore
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// Frame acquisition or detection did not complete in time
    #[error("Detector timeout: {source_id} ({consecutive} consecutive)")]
    DetectorTimeout { source_id: String, consecutive: u32 },

    /// Detection call failed
    #[error("Detection failed: {0}")]
    Detection(String),

    /// Transient persistence failure (retryable)
    #[error("Event store write failure: {0}")]
    EventStoreWriteFailure(String),

    /// Alert sink delivery failure (non-fatal)
    #[error("Notification delivery failure: {sink}: {message}")]
    NotificationDeliveryFailure { sink: String, message: String },

    /// Status change rejected
    #[error("Invalid status transition: {0}")]
    InvalidStatusTransition(String),

    /// Event not found
    #[error("Event not found: {0}")]
    EventNotFound(String),

    /// No stored snapshot for an event
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// SQLx database error
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl Error {
    /// Transient I/O-class errors that callers recover with retry/backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::EventStoreWriteFailure(_)
                | Error::DetectorTimeout { .. }
                | Error::NotificationDeliveryFailure { .. }
                | Error::Detection(_)
                | Error::Http(_)
                | Error::Io(_)
                | Error::Sqlx(_)
                | Error::Database(_)
        )
    }

    /// Stable machine-readable code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::SourceUnavailable { .. } => "SOURCE_UNAVAILABLE",
            Error::StreamAlreadyActive(_) => "STREAM_ALREADY_ACTIVE",
            Error::StreamNotActive(_) => "STREAM_NOT_ACTIVE",
            Error::SourceNotFound(_) => "SOURCE_NOT_FOUND",
            Error::DetectorTimeout { .. } => "DETECTOR_TIMEOUT",
            Error::Detection(_) => "DETECTION_ERROR",
            Error::EventStoreWriteFailure(_) => "EVENT_STORE_WRITE_FAILURE",
            Error::NotificationDeliveryFailure { .. } => "NOTIFICATION_DELIVERY_FAILURE",
            Error::InvalidStatusTransition(_) => "INVALID_STATUS_TRANSITION",
            Error::EventNotFound(_) => "EVENT_NOT_FOUND",
            Error::SnapshotNotFound(_) => "SNAPSHOT_NOT_FOUND",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) | Error::Sqlx(_) => "DATABASE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::StreamAlreadyActive(_) => StatusCode::CONFLICT,
            Error::InvalidStatusTransition(_) => StatusCode::CONFLICT,
            Error::StreamNotActive(_)
            | Error::SourceNotFound(_)
            | Error::EventNotFound(_)
            | Error::SnapshotNotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::SourceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::DetectorTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Detection(_) | Error::Http(_) | Error::NotificationDeliveryFailure { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Error::EventStoreWriteFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_)
            | Error::Database(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Internal(_)
            | Error::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                error_code = %error_code,
                message = %message,
                "Request error"
            );
        } else {
            tracing::warn!(
                status = %status,
                error_code = %error_code,
                message = %message,
                "Request rejected"
            );
        }

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
