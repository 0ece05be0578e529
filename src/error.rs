//! Error types for Penbox
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use thiserror::Error;

/// Application-wide error type
///
/// Federation failures are split by who can act on them: malformed input
/// and bad signatures are terminal for the peer, unreachable actors and
/// delivery failures are retryable by the caller.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Malformed request (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Signature verification failed (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// Malformed key material or signature bytes (500)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Remote actor could not be fetched or parsed (502)
    #[error("Unreachable actor: {0}")]
    UnreachableActor(String),

    /// Delivery to a remote inbox failed (502)
    #[error("Delivery failure: {0}")]
    Delivery(String),

    /// Other federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Rebuild an owned error from one shared between coalesced callers.
    ///
    /// Variants that callers branch on keep their identity; everything else
    /// collapses into `UnreachableActor` since shared errors only come out of
    /// remote actor resolution.
    pub fn from_shared(err: Arc<AppError>) -> Self {
        match err.as_ref() {
            AppError::NotFound => AppError::NotFound,
            AppError::Forbidden => AppError::Forbidden,
            AppError::Validation(msg) => AppError::Validation(msg.clone()),
            AppError::UnreachableActor(msg) => AppError::UnreachableActor(msg.clone()),
            other => AppError::UnreachableActor(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body. Server-side failures never echo internals.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string(), "unauthorized"),
            AppError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                self.to_string(),
                "invalid_signature",
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string(), "forbidden"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::UnreachableActor(_) => (
                StatusCode::BAD_GATEWAY,
                "Remote actor unreachable".to_string(),
                "unreachable_actor",
            ),
            AppError::Delivery(_) => (
                StatusCode::BAD_GATEWAY,
                "Delivery failed".to_string(),
                "delivery",
            ),
            AppError::Federation(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "federation"),
            AppError::HttpClient(_) => (
                StatusCode::BAD_GATEWAY,
                "HTTP client error".to_string(),
                "http_client",
            ),
            AppError::Crypto(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "crypto",
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
            ),
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "config",
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = ?self, error_type, "Request failed");
        }

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[error_type])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}
