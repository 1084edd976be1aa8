//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **AppError**: what HTTP handlers return. Each variant maps to a status
//!   code and a JSON body, so a failed request always looks the same to clients.
//! - **Domain errors** (`StoreError`, `ConnectError`, `ReverseError`, ...):
//!   what the relay internals return. They are `thiserror` enums so callers can
//!   match on the failure kind (the reverse pipeline, for example, treats a
//!   truncated response differently from a timeout).
//!
//! ## Key Rust Concepts:
//! - **From trait**: lets `?` convert a lower-level error into ours
//! - **ResponseError trait**: actix-web turns an `Err(AppError)` into a response
//! - **#[derive(Error)]**: thiserror writes the `Display` and `source()` impls

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// HTTP-facing error type.
///
/// ## Error Categories:
/// - **Internal / ConfigError**: server-side problems (500)
/// - **BadRequest / ValidationError**: the client sent something unusable (400)
/// - **Unauthorized**: missing or unknown session (401)
/// - **NotFound**: unknown room or resource (404)
/// - **ServiceUnavailable**: the relay reports itself unhealthy (503)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    ServiceUnavailable(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts errors into the JSON body every endpoint shares:
///
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "missing query parameter: room_id",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON errors on the HTTP surface come from client bodies, hence 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Backend(e) => AppError::Internal(format!("session lookup failed: {}", e)),
            other => AppError::Unauthorized(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures talking to the ordered message store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("index {index} out of range for {key}")]
    OutOfRange { key: String, index: usize },
}

/// Failures opening the streaming connection to the translation backend.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to sign backend token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),

    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection attempt cancelled")]
    Cancelled,
}

/// A backend text frame that could not be turned into a transcript fragment.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("text frame is not a JSON object")]
    NotJson,

    #[error("invalid fragment JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Failures of a single reverse-translation request.
#[derive(Debug, Error)]
pub enum ReverseError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The response body ended before the JSON document did.
    #[error("response body was truncated")]
    Truncated,

    #[error("reverse translation backend returned status {0}")]
    Status(u16),

    #[error("invalid response body: {0}")]
    Decode(serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("failed to build resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),

    #[error("resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),
}

/// Reasons the WebSocket session gate refuses an upgrade.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing session cookie")]
    MissingCookie,

    #[error("session is unknown or expired")]
    UnknownSession,

    #[error("session store error: {0}")]
    Backend(#[from] redis::RedisError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::BadRequest("x".into()).error_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Unauthorized("x".into()).error_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::ServiceUnavailable("x".into()).error_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_auth_error_maps_to_unauthorized() {
        let err: AppError = AuthError::UnknownSession.into();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }
}
