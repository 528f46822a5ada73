//! In-process control stream pair
//!
//! Backed by [`tokio::io::duplex`]; used by tests and local tooling that
//! exercise the control protocol without sockets or TLS.

use crate::FramedControlStream;
use tokio::io::DuplexStream;

/// A framed control stream over an in-memory pipe
pub type MemControlStream = FramedControlStream<DuplexStream>;

/// Create a connected pair of in-memory control streams
pub fn pair() -> (MemControlStream, MemControlStream) {
    let (left, right) = tokio::io::duplex(256 * 1024);
    (
        FramedControlStream::new(left, None),
        FramedControlStream::new(right, None),
    )
}
