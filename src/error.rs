//! # Error Handling
//!
//! All error types used by the bridge live here, grouped by the layer that
//! produces them:
//!
//! - **TransformError**: one audio transform rejected its input. Local to a
//!   single offloaded task, never fatal for the worker or its siblings.
//! - **PoolError**: the offload pool could not deliver a result (closed,
//!   cancelled at shutdown, or the transform failed).
//! - **SessionError**: a call session refused an operation (leg re-binding,
//!   capacity, unknown session).
//! - **BridgeError**: the relay loop of one leg stopped (transport closed,
//!   rendezvous timeout, protocol violation).
//! - **CallControlError**: the telephony REST API refused a command.
//! - **AppError**: what the HTTP layer turns into a JSON error response.
//!
//! ## Propagation:
//! Transform errors stay inside one task slot. Transport errors end the owning
//! bridge and cascade into a controlled teardown of the paired leg. Duplicate
//! teardown is not an error at all: the session's completion flag swallows it.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::call::session::LegRole;

/// A single audio transform failed on its input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    /// Input length is not a whole number of samples for the expected width
    #[error("malformed audio input: {0}")]
    MalformedInput(String),

    /// Mixing gains were negative, non-finite or summed to zero
    #[error("invalid gain: {0}")]
    InvalidGain(String),

    /// The transform panicked inside a worker; the worker survives
    #[error("transform panicked: {0}")]
    Panicked(String),
}

/// Failure to obtain a result from the offload pool.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    /// Submission attempted after `close()`
    #[error("offload pool is closed")]
    Closed,

    /// Task was still outstanding when the pool shut down
    #[error("task cancelled by pool shutdown")]
    Cancelled,

    /// The worker reported a transform failure for this task
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// `submit_batch` was called with a batch size of zero
    #[error("batch size must be >= 1")]
    InvalidBatchSize,
}

/// Rejected operations on a call session or the session registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("{0} leg is already attached")]
    LegAlreadyAttached(LegRole),

    #[error("session {0} is already completed")]
    SessionClosed(String),

    #[error("maximum concurrent sessions ({0}) reached")]
    CapacityReached(usize),

    #[error("session {0} not found")]
    NotFound(String),
}

/// Reasons a bridge relay loop stops.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A leg socket or the translation socket closed or refused a write
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// The opposite leg never produced its stream identifier, or the second
    /// leg never arrived, within the bounded wait
    #[error("{role} leg did not become ready within {waited_secs}s")]
    RendezvousTimeout { role: LegRole, waited_secs: u64 },

    /// A peer sent something that is not valid protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Session acquisition or handshake with the translation service failed
    #[error("translation service error: {0}")]
    Translation(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// Dialling out to the operator failed
    #[error(transparent)]
    CallControl(#[from] CallControlError),
}

/// The telephony provider refused or failed a call-control command.
#[derive(Debug, Error)]
pub enum CallControlError {
    #[error("telephony request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telephony API returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected telephony response: {0}")]
    InvalidResponse(String),
}

/// HTTP-facing error type.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::NotFound(format!("session {id}")));
/// ```
#[derive(Debug, Error)]
pub enum AppError {
    /// Server-side failures (collaborator unreachable, unexpected state)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Client sent invalid or malformed data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Requested session or resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request conflicts with current session state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The service cannot take more calls right now
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "session 1f0c... not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::Conflict(msg) => (
                actix_web::http::StatusCode::CONFLICT,
                "conflict",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Session refusals map onto HTTP status codes for the webhook and
/// websocket handlers.
impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => AppError::NotFound(err.to_string()),
            SessionError::LegAlreadyAttached(_) | SessionError::SessionClosed(_) => {
                AppError::Conflict(err.to_string())
            }
            SessionError::CapacityReached(_) => AppError::Unavailable(err.to_string()),
        }
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_errors_map_to_http_status() {
        let not_found: AppError = SessionError::NotFound("abc".to_string()).into();
        assert_eq!(not_found.error_response().status(), 404);

        let conflict: AppError = SessionError::LegAlreadyAttached(LegRole::Client).into();
        assert_eq!(conflict.error_response().status(), 409);

        let full: AppError = SessionError::CapacityReached(3).into();
        assert_eq!(full.error_response().status(), 503);
    }

    #[test]
    fn test_transform_error_passes_through_pool_error() {
        let err: PoolError = TransformError::MalformedInput("odd length".to_string()).into();
        assert_eq!(err.to_string(), "malformed audio input: odd length");
    }
}
