//! Length-prefixed bincode framing for control messages
//!
//! Wire format: a big-endian `u32` payload length followed by the bincode
//! encoding of one [`ControlMessage`]. Frames above [`MAX_FRAME_SIZE`] are
//! rejected on both sides.

use crate::messages::ControlMessage;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: u32, max: u32 },
}

/// Stateless encoder/decoder for the control wire format
pub struct ControlCodec;

impl ControlCodec {
    /// Encode a message into a ready-to-send frame (length prefix included)
    pub fn encode(message: &ControlMessage) -> Result<Vec<u8>, CodecError> {
        let payload = bincode::serialize(message)?;
        if payload.len() > MAX_FRAME_SIZE as usize {
            return Err(CodecError::FrameTooLarge {
                size: payload.len() as u32,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode one message from the front of `buf`, consuming its bytes
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
    /// the caller should read more data and retry.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        if buf.len() < 4 + len as usize {
            return Ok(None);
        }

        buf.advance(4);
        let payload = buf.split_to(len as usize);
        let message = bincode::deserialize(&payload)?;
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ClientKind, Credentials};
    use crate::PROTOCOL_VERSION;
    use uuid::Uuid;

    fn hello() -> ControlMessage {
        ControlMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            credentials: Credentials {
                endpoint_id: 7,
                key: Uuid::new_v4(),
            },
            kind: ClientKind::Collector,
        }
    }

    #[test]
    fn test_encode_decode() {
        let msg = hello();
        let frame = ControlCodec::encode(&msg).unwrap();

        let mut buf = BytesMut::from(&frame[..]);
        let decoded = ControlCodec::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_frame_waits() {
        let frame = ControlCodec::encode(&hello()).unwrap();

        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(ControlCodec::decode(&mut buf).unwrap().is_none());

        // Completing the frame makes it decodable
        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert!(ControlCodec::decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_decode_consumes_frames_in_order() {
        let first = ControlMessage::Heartbeat;
        let second = ControlMessage::Disconnect {
            reason: "shutting down".to_string(),
        };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&ControlCodec::encode(&first).unwrap());
        buf.extend_from_slice(&ControlCodec::encode(&second).unwrap());

        assert_eq!(ControlCodec::decode(&mut buf).unwrap(), Some(first));
        assert_eq!(ControlCodec::decode(&mut buf).unwrap(), Some(second));
        assert_eq!(ControlCodec::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE + 1);
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            ControlCodec::decode(&mut buf),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }
}
