//! Centralized error types for the Listen Together core library.
//!
//! This module provides a unified error handling system that:
//! - Defines the coordination error taxonomy using `thiserror`
//! - Maps errors to machine-readable codes and HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses on the
//!   REST fallback surface

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::protocol_constants::{MAX_CONFLICT_RETRY_AFTER_MS, MIN_CONFLICT_RETRY_AFTER_MS};

/// Application-wide error type for the Listen Together coordinator.
///
/// These are error *kinds*, not transport shapes: the WebSocket layer turns
/// them into acknowledgement payloads, the REST fallback into JSON bodies.
#[derive(Debug, Clone, Error)]
pub enum ListenError {
    /// Bearer token missing, invalid, or expired; the handshake is refused.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Malformed payload, out-of-range index, or empty track list. No state
    /// change occurred.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The socket has not joined a group yet.
    #[error("Not in a group")]
    NotInGroup,

    /// The caller is not a member of the target group.
    #[error("Not a member of this group")]
    NotMember,

    /// Group removed or never existed. Never creates the group.
    #[error("Group not found: {0}")]
    NotFound(String),

    /// Mutation lock contended or the authoritative snapshot raced us.
    /// Transient; the client retries after the hint.
    #[error("Group is busy, retry shortly")]
    Conflict {
        /// Suggested client backoff before retrying (ms).
        retry_after_ms: u64,
    },

    /// Store / bus / lock transport failure.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),
}

impl ListenError {
    /// Returns a machine-readable error code for acknowledgements and API
    /// responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthFailed(_) => "AUTH_FAILED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::NotInGroup => "NOT_IN_GROUP",
            Self::NotMember => "NOT_MEMBER",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::Infrastructure(_) => "INFRASTRUCTURE",
        }
    }

    /// Whether the client should retry the same request unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Maps the error to an appropriate HTTP status code (REST fallback).
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotInGroup | Self::NotMember => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Builds a CONFLICT error with the retry-after hint derived from the
    /// lock TTL: `ttl / 10`, clamped to the protocol bounds.
    pub fn conflict_for_ttl(lock_ttl_ms: u64) -> Self {
        Self::Conflict {
            retry_after_ms: (lock_ttl_ms / 10)
                .clamp(MIN_CONFLICT_RETRY_AFTER_MS, MAX_CONFLICT_RETRY_AFTER_MS),
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type ListenResult<T> = Result<T, ListenError>;

/// JSON response body for REST error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "retryAfterMs")]
    retry_after_ms: Option<u64>,
}

impl IntoResponse for ListenError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after_ms = match self {
            Self::Conflict { retry_after_ms } => Some(retry_after_ms),
            _ => None,
        };
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code(),
            status: status.as_u16(),
            retry_after_ms,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_retry_hint_is_ttl_fraction_clamped() {
        // Default 3s TTL -> 300ms hint
        assert!(
            matches!(ListenError::conflict_for_ttl(3_000), ListenError::Conflict { retry_after_ms: 300 })
        );
        // Tiny TTL clamps to the floor
        assert!(
            matches!(ListenError::conflict_for_ttl(100), ListenError::Conflict { retry_after_ms: 75 })
        );
        // Huge TTL clamps to the ceiling
        assert!(
            matches!(ListenError::conflict_for_ttl(60_000), ListenError::Conflict { retry_after_ms: 500 })
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ListenError::NotInGroup.code(), "NOT_IN_GROUP");
        assert_eq!(
            ListenError::Conflict { retry_after_ms: 300 }.code(),
            "CONFLICT"
        );
        assert_eq!(ListenError::NotFound("g".into()).code(), "NOT_FOUND");
    }

    #[test]
    fn only_conflict_is_transient() {
        assert!(ListenError::Conflict { retry_after_ms: 300 }.is_transient());
        assert!(!ListenError::NotMember.is_transient());
        assert!(!ListenError::Infrastructure("redis down".into()).is_transient());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ListenError::AuthFailed("bad token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ListenError::NotFound("g1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ListenError::Conflict { retry_after_ms: 75 }.status_code(),
            StatusCode::CONFLICT
        );
    }
}
