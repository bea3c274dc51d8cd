//! # Error Handling
//!
//! This module defines every error type the backend produces and how the HTTP-facing
//! ones are converted into responses.
//!
//! ## Error Taxonomy:
//! - **FrameError**: A binary audio frame from the client could not be decoded.
//!   The frame is dropped and the connection stays open.
//! - **ProtocolError**: A JSON control message was malformed or named an unknown command.
//!   Reported to the client as an `error` event, the connection stays open.
//! - **AdapterError**: A speech-to-text, language-model or speech-synthesis provider failed
//!   (including timeouts). Reported as an `error` event and the current turn is aborted.
//! - **AppError**: HTTP endpoint failures, rendered as JSON error bodies.
//!
//! ## Key Rust Concepts:
//! - **thiserror**: Derives `std::error::Error` and `Display` from `#[error(...)]` attributes
//! - **From trait**: Lets `?` convert between error types automatically
//! - **ResponseError trait**: Converts errors to HTTP responses

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use thiserror::Error;

/// Errors produced while decoding an inbound binary audio frame.
///
/// ## Wire Format Reminder:
/// `[4-byte timestamp][4-byte status flags][PCM16 payload]`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer than the 8 header bytes were available
    #[error("audio frame truncated: {len} bytes, header needs 8")]
    Truncated { len: usize },

    /// Payload is not a whole number of 16-bit samples
    #[error("audio frame payload has odd length {len}, expected whole 16-bit samples")]
    OddPayload { len: usize },
}

/// Errors produced when a client control message cannot be understood.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The text frame was not valid JSON or had no string `type` field
    #[error("malformed control message: {0}")]
    Malformed(String),

    /// The `type` field named a command this server does not know
    #[error("unknown command type: {0}")]
    UnknownCommand(String),
}

/// Errors produced by streaming providers (STT, LLM, TTS).
///
/// ## Propagation Policy:
/// The orchestrator catches these at the stage boundary, emits exactly one `error`
/// event to the client and returns the turn state machine to `Idle`. They never
/// tear down the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// Network or transport level failure talking to the provider
    #[error("provider request failed: {0}")]
    Request(String),

    /// The provider answered, but with an error or an unusable payload
    #[error("provider returned an error: {0}")]
    Provider(String),

    /// The provider did not respond (or cancel) within the configured bound
    #[error("{0} timed out")]
    Timeout(String),

    /// The provider is misconfigured (unknown name, missing credentials, ...)
    #[error("provider configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout(format!("provider request ({})", err))
        } else {
            AdapterError::Request(err.to_string())
        }
    }
}

/// Custom error types for the HTTP API.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **ServiceUnavailable**: No capacity left for a new session (503 errors)
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::NotFound(format!("Session '{}' not found", id)));
/// ```
#[derive(Debug, Error)]
pub enum AppError {
    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Client sent invalid or malformed data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Requested resource was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration file, environment variable or provider setup problems
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// User input failed validation rules
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The server cannot accept more conversations right now
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Session 'abc' not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        // Map each error type to HTTP status code, error type, and message
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,  // 404
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "validation_error",
                msg.clone(),
            ),
            AppError::ServiceUnavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,  // 503
                "service_unavailable",
                msg.clone(),
            ),
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

/// Automatic conversion from anyhow::Error to AppError.
///
/// ## Usage:
/// When you use `?` with an anyhow::Error inside a handler, it becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
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

/// A provider that cannot even be constructed is a server configuration problem.
impl From<AdapterError> for AppError {
    fn from(err: AdapterError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use our HTTP error type.
pub type AppResult<T> = Result<T, AppError>;
