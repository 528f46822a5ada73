//! Fleetlink endpoint client
//!
//! The embeddable client side of the control plane, shared by agents,
//! collectors, and processing plugins: enroll once, persist the returned
//! credentials, then hold a control session that receives configuration
//! pushes and reports liveness. Consumers receive pushed payloads over an
//! mpsc channel and the client acknowledges each one on the wire.

pub mod client;
pub mod credentials;
pub mod reconnect;

pub use client::{
    deregister, enroll, ensure_enrolled, ClientConfig, ConfigUpdate, FleetClient,
    DEFAULT_HEARTBEAT_INTERVAL,
};
pub use credentials::CredentialStore;
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};

use fleetlink_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the endpoint client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server rejected enrollment, the session handshake, or
    /// deregistration. Deliberate refusals are not retried.
    #[error("denied by server: {0}")]
    Denied(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("credential storage error: {0}")]
    Credentials(String),

    #[error("reconnection attempts exhausted")]
    RetriesExhausted,
}
