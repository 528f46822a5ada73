//! Framed control stream over any async byte transport

use crate::{ControlStream, TransportError, TransportResult};
use async_trait::async_trait;
use bytes::BytesMut;
use fleetlink_proto::{ControlCodec, ControlMessage};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// [`ControlStream`] implementation that frames messages with
/// [`ControlCodec`] over an `AsyncRead + AsyncWrite` transport
pub struct FramedControlStream<S> {
    io: S,
    recv_buffer: BytesMut,
    peer_addr: Option<SocketAddr>,
    closed: bool,
}

impl<S> FramedControlStream<S> {
    pub fn new(io: S, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            io,
            recv_buffer: BytesMut::with_capacity(8 * 1024),
            peer_addr,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> ControlStream for FramedControlStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: &ControlMessage) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        let frame = ControlCodec::encode(message)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        self.io.write_all(&frame).await?;
        self.io.flush().await?;

        trace!("Sent control message: {:?}", message);
        Ok(())
    }

    async fn recv(&mut self) -> TransportResult<Option<ControlMessage>> {
        loop {
            match ControlCodec::decode(&mut self.recv_buffer)
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?
            {
                Some(message) => {
                    trace!("Received control message: {:?}", message);
                    return Ok(Some(message));
                }
                None => {
                    let n = self.io.read_buf(&mut self.recv_buffer).await?;
                    if n == 0 {
                        if self.recv_buffer.is_empty() {
                            return Ok(None);
                        }
                        return Err(TransportError::ProtocolError(
                            "incomplete frame at end of stream".to_string(),
                        ));
                    }
                }
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        if !self.closed {
            self.closed = true;
            self.io.shutdown().await?;
        }
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem;

    #[tokio::test]
    async fn test_send_recv_over_duplex() {
        let (mut left, mut right) = mem::pair();

        left.send(&ControlMessage::Heartbeat).await.unwrap();
        left.send(&ControlMessage::Disconnect {
            reason: "done".to_string(),
        })
        .await
        .unwrap();

        assert_eq!(right.recv().await.unwrap(), Some(ControlMessage::Heartbeat));
        assert_eq!(
            right.recv().await.unwrap(),
            Some(ControlMessage::Disconnect {
                reason: "done".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_peer_closes() {
        let (mut left, mut right) = mem::pair();

        left.send(&ControlMessage::Heartbeat).await.unwrap();
        left.close().await.unwrap();

        assert_eq!(right.recv().await.unwrap(), Some(ControlMessage::Heartbeat));
        assert_eq!(right.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (mut left, _right) = mem::pair();

        left.close().await.unwrap();
        let err = left.send(&ControlMessage::Heartbeat).await.unwrap_err();
        assert!(matches!(err, TransportError::StreamClosed));
    }
}
