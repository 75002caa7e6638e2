//! Length-prefixed framing with strict validation.
//!
//! Oversized or malformed frames are protocol errors; the connection
//! manager terminates the connection rather than resynchronize.

use super::types::MessageType;
use crate::error::{ProtocolError, Result};
use crate::MAX_FRAME_BYTES;

/// Bytes before the payload: length (4) + type (1).
pub const HEADER_SIZE: usize = 5;

/// A complete wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type.
    pub frame_type: MessageType,
    /// Raw payload (sealed for record types, plaintext for handshake/BYE).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, rejecting payloads that would exceed the frame cap.
    pub fn new(frame_type: MessageType, payload: Vec<u8>) -> Result<Self> {
        if 1 + payload.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::BadFrame("payload too large".into()).into());
        }
        Ok(Self {
            frame_type,
            payload,
        })
    }

    /// Serialize for transmission: `length(4,BE) ‖ type(1) ‖ payload`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let length = (1 + self.payload.len()) as u32;
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&length.to_be_bytes());
        out.push(self.frame_type.to_byte());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Incremental frame extractor for a byte stream.
///
/// Socket reads are appended with [`push`](Self::push); complete frames
/// are drained with [`try_read`](Self::try_read). Any framing error is
/// fatal for the stream.
#[derive(Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Fresh reader with an empty buffer.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract one complete frame.
    ///
    /// `Ok(Some(frame))` when a frame is complete, `Ok(None)` when more
    /// bytes are needed. On `Err` the buffer is cleared and the connection
    /// must be terminated.
    pub fn try_read(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if length == 0 || length > MAX_FRAME_BYTES {
            self.buffer.clear();
            return Err(ProtocolError::BadFrame(format!("frame length {length}")).into());
        }

        let total = 4 + length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame_type = match MessageType::from_byte(self.buffer[4]) {
            Ok(t) => t,
            Err(e) => {
                self.buffer.clear();
                return Err(e);
            }
        };

        let payload = self.buffer[5..total].to_vec();
        self.buffer.drain(..total);

        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
