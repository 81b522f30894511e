//! Error taxonomy for the bridge relay.
//!
//! Each subsystem gets its own error enum rather than one shared type.
//! `AppError` is the thin HTTP-facing error for the `/health` and
//! `/status` surface; it never appears on the relay's hot path.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

// `ConfigError` lives in `config.rs`, next to the loader it reports on.

/// Local persistence I/O failure.
#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors surfaced by a ledger adapter (source or destination).
#[derive(Debug)]
pub enum AdapterError {
    /// Network-level failure: timeouts, 5xx, connection resets. The
    /// owner of the stream/RPC retries.
    Transient(String),
    /// Permanent until configuration changes. Fatal for this adapter instance.
    Auth(String),
    /// A single event could not be decoded; logged and skipped, never
    /// kills the stream.
    Decoding(String),
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::Transient(msg) => write!(f, "transient adapter error: {msg}"),
            AdapterError::Auth(msg) => write!(f, "adapter auth error: {msg}"),
            AdapterError::Decoding(msg) => write!(f, "adapter decoding error: {msg}"),
        }
    }
}

impl std::error::Error for AdapterError {}

/// A deposit event failed validation. Dropped with a warning, never retried.
#[derive(Debug)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "validation error: {}", self.0)
    }
}

impl std::error::Error for ValidationError {}

/// Thin HTTP-facing error for the operational `/health` and `/status`
/// surface. Logs the full cause server-side, returns a sanitized body.
#[derive(Debug)]
pub enum AppError {
    Unavailable(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::Unavailable(_) => "UNAVAILABLE",
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            AppError::Unavailable(_) => "service unavailable",
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Unavailable(msg) => write!(f, "unavailable: {msg}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!(error = %self, "status request failed");
        let status = self.status_code();
        let body = json!({
            "error": self.public_message(),
            "code": self.error_code(),
        });
        (status, axum::Json(body)).into_response()
    }
}
