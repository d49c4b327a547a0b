//! Error types for Lightpub
//!
//! Every fallible operation in the crate returns `AppError`. The variants
//! follow the federation error taxonomy (decode, validation, verification,
//! resolution, state, delivery) plus the opaque storage/internal failures.
//! `IntoResponse` maps them onto HTTP status codes for the inbox and the
//! other federation endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed JSON or a payload that is not a JSON object (400)
    #[error("Decode error: {0}")]
    Decode(String),

    /// Required field missing or ill-formed (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Outer or embedded `type` is not one this server understands (400)
    #[error("Unsupported activity type: {0}")]
    UnsupportedActivityType(String),

    /// HTTP signature missing, malformed, expired or mismatched (401)
    #[error("Signature verification failed: {0}")]
    Verification(String),

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Actor could not be found locally or remotely (404)
    #[error("Actor not found: {0}")]
    ActorNotFound(String),

    /// `Accept` header names no ActivityPub media type (406)
    #[error("Not acceptable")]
    NotAcceptable,

    /// Request body is not an ActivityPub document (415)
    #[error("Unsupported media type")]
    UnsupportedMediaType,

    /// Follow/accept/state query with follower == followed (400)
    #[error("Cannot follow self")]
    CannotFollowSelf,

    /// A block exists between the two actors (403)
    #[error("Cannot follow blocked user")]
    CannotFollowBlock,

    /// Remote actor, key or WebFinger document unusable or unreachable (502)
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// Single inbox delivery failed (502)
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Operation deadline elapsed (504)
    #[error("Timed out: {0}")]
    Timeout(&'static str),

    /// Operation cancelled by its caller (503)
    #[error("Cancelled: {0}")]
    Cancelled(&'static str),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(err.into())
    }
}

impl AppError {
    /// Whether the caller may reasonably retry the same operation later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AppError::Timeout(_)
                | AppError::Cancelled(_)
                | AppError::Resolution(_)
                | AppError::HttpClient(_)
                | AppError::Delivery(_)
        )
    }

    /// Short machine-readable label, used for metrics and the JSON body.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Decode(_) => "decode",
            AppError::Validation(_) => "validation",
            AppError::UnsupportedActivityType(_) => "unsupported_activity_type",
            AppError::Verification(_) => "verification",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::NotFound => "not_found",
            AppError::ActorNotFound(_) => "actor_not_found",
            AppError::NotAcceptable => "not_acceptable",
            AppError::UnsupportedMediaType => "unsupported_media_type",
            AppError::CannotFollowSelf => "cannot_follow_self",
            AppError::CannotFollowBlock => "cannot_follow_block",
            AppError::Resolution(_) => "resolution",
            AppError::Delivery(_) => "delivery",
            AppError::HttpClient(_) => "http_client",
            AppError::Timeout(_) => "timeout",
            AppError::Cancelled(_) => "cancelled",
            AppError::Database(_) => "database",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Decode(_)
            | AppError::Validation(_)
            | AppError::UnsupportedActivityType(_)
            | AppError::CannotFollowSelf => StatusCode::BAD_REQUEST,
            AppError::Verification(_) | AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden | AppError::CannotFollowBlock => StatusCode::FORBIDDEN,
            AppError::NotFound | AppError::ActorNotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            AppError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Resolution(_) | AppError::Delivery(_) | AppError::HttpClient(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Storage and internal failures are reported with an opaque message;
    /// the cause is only logged.
    fn into_response(self) -> Response {
        use axum::Json;

        let status = self.status_code();
        let error_type = self.kind();
        let error_message = match &self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) | AppError::Config(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, error_type, "Request failed");
        } else {
            tracing::debug!(error = %self, error_type, "Request rejected");
        }

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
