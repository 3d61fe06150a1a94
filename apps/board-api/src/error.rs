use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Structured API error returned to clients.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND".to_string(),
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED".to_string(),
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "FORBIDDEN".to_string(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "UNAVAILABLE".to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Failure reported by a storage collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::not_found("Resource not found"),
            StoreError::Unavailable(_) => {
                tracing::error!(?err, "storage unavailable");
                Self::unavailable("Storage temporarily unavailable")
            }
            other => {
                tracing::error!(err = ?other, "storage error");
                Self::internal("An internal error occurred")
            }
        }
    }
}

/// A rejected client event. Reported to the sender only, as an `error` envelope.
///
/// `code()` is a stable machine-readable tag; `Display` is safe to show users
/// and never carries internal error text.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Event board does not match this connection")]
    BoardMismatch,

    #[error("Unknown event type: {0}")]
    UnknownType(String),

    #[error("Event type {0} cannot be sent by clients")]
    UnsupportedType(&'static str),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Task not found")]
    NotFound,

    #[error("Failed to save changes")]
    Persistence,

    #[error("Failed to render task")]
    Render,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BoardMismatch => "board_mismatch",
            Self::UnknownType(_) => "unknown_type",
            Self::UnsupportedType(_) => "unsupported_type",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::NotFound => "not_found",
            Self::Persistence => "persistence_failed",
            Self::Render => "render_failed",
        }
    }

    /// Whether this error counts toward the reader's consecutive decode fault limit.
    pub fn is_decode_fault(&self) -> bool {
        matches!(self, Self::UnknownType(_) | Self::InvalidPayload(_))
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::NotFound,
            other => {
                tracing::error!(err = ?other, "persistence failure during mutation");
                Self::Persistence
            }
        }
    }
}
