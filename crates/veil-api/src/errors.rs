use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;
use veil_types::VeilError;

/// API-level error kinds, each mapping to an HTTP status and a sanitized
/// message. Raw lower-layer messages never reach the client; they are
/// logged against a synthetic error id instead.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Input validation errors (400 Bad Request)
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Upload exceeds the configured size limit (413)
    #[error("Payload too large: {message}")]
    PayloadTooLarge { message: String },

    /// Wrong or missing content type (415)
    #[error("Unsupported media type: {message}")]
    UnsupportedMediaType { message: String },

    /// Resource exhaustion: lock or semaphore starvation (503)
    #[error("Service overloaded: {message}")]
    Overloaded { message: String },

    /// Operation timed out (408)
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// PDF processing failed; the underlying message stays in the logs (500)
    #[error("Document processing failed")]
    Processing { detail: String },

    /// Detection subsystem failed (500)
    #[error("Detection failed")]
    Detection { detail: String },

    /// Anything else (500)
    #[error("Internal server error")]
    Internal { detail: String },
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Overloaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Self::Processing { .. } | Self::Detection { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::UnsupportedMediaType { .. } => "unsupported_media_type",
            Self::Overloaded { .. } => "overloaded",
            Self::Timeout { .. } => "timeout",
            Self::Processing { .. } => "processing",
            Self::Detection { .. } => "detection",
            Self::Internal { .. } => "internal",
        }
    }

    fn internal_detail(&self) -> Option<&str> {
        match self {
            Self::Processing { detail } | Self::Detection { detail } | Self::Internal { detail } => {
                Some(detail)
            }
            _ => None,
        }
    }
}

impl From<VeilError> for ApiError {
    fn from(error: VeilError) -> Self {
        match &error {
            VeilError::Validation { message } => Self::Validation {
                message: message.clone(),
            },
            VeilError::LockTimeout { .. } => Self::Overloaded {
                message: "the document is busy, retry shortly".to_string(),
            },
            VeilError::Timeout { operation } => Self::Timeout {
                operation: operation.clone(),
            },
            VeilError::MemoryPressure { .. } => Self::Overloaded {
                message: "the service is under memory pressure, retry shortly".to_string(),
            },
            VeilError::Pdf { message } => Self::Processing {
                detail: message.clone(),
            },
            VeilError::Detection { .. } | VeilError::DetectorUnavailable { .. } => Self::Detection {
                detail: error.to_string(),
            },
            _ => Self::Internal {
                detail: error.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    /// Uniform error envelope. Stack traces and lower-layer messages stay
    /// in the logs, keyed by the error id that does reach the client.
    fn into_response(self) -> Response {
        let error_id = Uuid::new_v4().to_string();
        let status = self.status_code();

        if let Some(detail) = self.internal_detail() {
            error!(error_id = %error_id, detail, "Request failed");
        } else {
            warn!(error_id = %error_id, error = %self, "Request rejected");
        }

        let body = json!({
            "error": self.to_string(),
            "error_id": error_id,
            "error_type": self.error_type(),
            "status": "error",
            "status_code": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        (status, Json(body)).into_response()
    }
}
