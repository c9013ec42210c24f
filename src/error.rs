//! Service-level error taxonomy and the JSON envelope the HTTP layer emits.
//!
//! Every handler returns `Result<_, Error>`; the `IntoResponse` impl maps the
//! variant to a status code and a stable `{"error": {...}}` body. Internal
//! error messages are stripped unless debug mode is on.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

static DEBUG_ERRORS: AtomicBool = AtomicBool::new(false);

/// Enable verbose internal error messages in responses (config `logging.debug`).
pub fn set_debug(enabled: bool) {
    DEBUG_ERRORS.store(enabled, Ordering::Relaxed);
}

tokio::task_local! {
    /// Set by the request-id middleware for the duration of each request so
    /// the envelope can echo the id the handler ran under.
    pub static REQUEST_ID: String;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed: {}", fields.join("; "))]
    Validation { fields: Vec<String> },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("upstream unavailable: {0}")]
    Network(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>) -> Self {
        Self::Validation { fields: vec![field.into()] }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound { kind, name: name.into() }
    }

    /// The wire-level `type` discriminator of the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Forbidden(_) => "forbidden",
            Self::Network(_) => "network",
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Top-level response envelope.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let internal = status == StatusCode::INTERNAL_SERVER_ERROR;

        if internal {
            tracing::error!(error = %self, "request failed");
        }

        let message = if internal && !DEBUG_ERRORS.load(Ordering::Relaxed) {
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let details = match &self {
            Error::Validation { fields } if fields.len() > 1 => Some(fields.clone()),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorBody {
                kind: self.kind().to_string(),
                message,
                code: Some(status.as_u16()),
                timestamp: chrono::Utc::now().to_rfc3339(),
                request_id: REQUEST_ID.try_with(|id| id.clone()).ok(),
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}
