//! Control-plane transport layer
//!
//! Provides the [`ControlStream`] abstraction the session handler and fleet
//! client are written against, a framed implementation over any async byte
//! stream, the TLS listener/connector used in production, and an in-process
//! pair for tests.

pub mod framed;
pub mod mem;
pub mod tls;

use async_trait::async_trait;
use fleetlink_proto::ControlMessage;
use std::net::SocketAddr;
use thiserror::Error;

pub use framed::FramedControlStream;
pub use tls::{TlsClientConfig, TlsControlListener, TlsServerConfig};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("stream closed")]
    StreamClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// One bidirectional control-message stream
///
/// `recv` returning `Ok(None)` means the peer finished its send side cleanly;
/// the stream may still accept outbound messages after that point.
#[async_trait]
pub trait ControlStream: Send {
    /// Send one message
    async fn send(&mut self, message: &ControlMessage) -> TransportResult<()>;

    /// Receive the next message; `Ok(None)` on clean end-of-stream
    async fn recv(&mut self) -> TransportResult<Option<ControlMessage>>;

    /// Close the stream
    async fn close(&mut self) -> TransportResult<()>;

    /// Remote address, when the underlying transport has one
    fn peer_addr(&self) -> Option<SocketAddr>;
}
