//! Control-plane error taxonomy

use fleetlink_proto::EndpointId;
use thiserror::Error;

/// Errors surfaced by the control-plane services
#[derive(Debug, Error)]
pub enum ControlError {
    /// A live session already exists for this identity; the new connection
    /// is rejected, never queued or swapped in
    #[error("endpoint {0} is already connected")]
    AlreadyConnected(EndpointId),

    /// Re-registration attempt from a different network origin
    #[error("registration conflict: {0}")]
    Conflict(String),

    /// Operation on an unknown identity or credential
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient failure; the caller should retry with backoff
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Unexpected failure, e.g. a durable-store write error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sea_orm::DbErr> for ControlError {
    fn from(err: sea_orm::DbErr) -> Self {
        ControlError::Internal(err.to_string())
    }
}
