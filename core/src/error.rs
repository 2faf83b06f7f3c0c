//! Centralized error types for the media control plane core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for a session adapter.
///
/// Variants map to the taxonomy in the external interface surface:
/// preconditions, conflicts, upstream unavailability, SFU failures, and
/// malformed client payloads.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AdapterError {
    /// An operation was attempted before its precondition was met
    /// (e.g. `connect` before `publish`, `start-forwarding` before `connect`).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A conflicting operation was attempted (e.g. publish while already published).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The upstream AI provider link could not be established or failed mid-session.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The SFU REST surface returned a non-2xx response that is not the
    /// documented "already closed" idempotent success case.
    #[error("SFU error: {0}")]
    SfuError(String),

    /// A client-submitted payload was missing a required field or malformed.
    #[error("bad payload: {0}")]
    BadPayload(String),

    /// The session referenced does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Internal error with no externally actionable cause.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdapterError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::Conflict(_) => "conflict",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::SfuError(_) => "sfu_error",
            Self::BadPayload(_) => "bad_payload",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PreconditionFailed(_) | Self::BadPayload(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SfuError(_) | Self::UpstreamUnavailable(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Convenient Result alias for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for AdapterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_returns_409() {
        let err = AdapterError::Conflict("already published".into());
        assert_eq!(err.code(), "conflict");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn precondition_failed_returns_400() {
        let err = AdapterError::PreconditionFailed("not published".into());
        assert_eq!(err.code(), "precondition_failed");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn session_not_found_returns_404() {
        let err = AdapterError::SessionNotFound("s1".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
