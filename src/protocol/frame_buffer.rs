//! Frame accumulation for the data socket.
//!
//! Opcode-prefixed frame bodies are not self-delimiting over a raw byte
//! stream (a DATA payload may contain anything), so the socket layer wraps
//! every body in a little-endian `u32` length prefix. This module extracts
//! complete bodies from partial reads with a two-state machine:
//! - `WaitingForLength`: need the 4 prefix bytes
//! - `WaitingForBody`: length parsed, need N more bytes

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{BridgeError, Result};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame body size (16 MB). Serial traffic is small; a
/// larger claim means a corrupt or hostile peer.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Wrap a frame body in its length prefix, ready to write to the socket.
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the complete length prefix.
    WaitingForLength,
    /// Length parsed, waiting for the body bytes.
    WaitingForBody { remaining: u32 },
}

/// Buffer accumulating socket reads and extracting complete frame bodies.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a frame buffer with default limits.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForLength,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a frame buffer with a custom maximum body size.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frame bodies.
    ///
    /// Partial data is retained internally for the next push.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut bodies = Vec::new();
        while let Some(body) = self.try_extract_one()? {
            bodies.push(body);
        }
        Ok(bodies)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            State::WaitingForLength => {
                if self.buffer.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let length = u32::from_le_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]);
                if length > self.max_frame_size {
                    return Err(BridgeError::Protocol(format!(
                        "frame size {} exceeds maximum {}",
                        length, self.max_frame_size
                    )));
                }
                let _ = self.buffer.split_to(LENGTH_PREFIX_SIZE);

                self.state = State::WaitingForBody { remaining: length };
                self.try_extract_one()
            }

            State::WaitingForBody { remaining } => {
                let remaining = remaining as usize;
                if self.buffer.len() < remaining {
                    return Ok(None);
                }
                let body = self.buffer.split_to(remaining).freeze();
                self.state = State::WaitingForLength;
                Ok(Some(body))
            }
        }
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check whether the buffer holds no partial data.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop buffered data and reset the state machine.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let encoded = encode_frame(b"\x0ahello");

        let bodies = buffer.push(&encoded).unwrap();

        assert_eq!(bodies.len(), 1);
        assert_eq!(&bodies[0][..], b"\x0ahello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = Vec::new();
        combined.extend_from_slice(&encode_frame(b"first"));
        combined.extend_from_slice(&encode_frame(b"second"));
        combined.extend_from_slice(&encode_frame(b"third"));

        let bodies = buffer.push(&combined).unwrap();

        assert_eq!(bodies.len(), 3);
        assert_eq!(&bodies[0][..], b"first");
        assert_eq!(&bodies[1][..], b"second");
        assert_eq!(&bodies[2][..], b"third");
    }

    #[test]
    fn test_fragmented_length_prefix() {
        let mut buffer = FrameBuffer::new();
        let encoded = encode_frame(b"test");

        assert!(buffer.push(&encoded[..2]).unwrap().is_empty());
        let bodies = buffer.push(&encoded[2..]).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(&bodies[0][..], b"test");
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new();
        let encoded = encode_frame(b"a longer body split mid-way");

        let split = LENGTH_PREFIX_SIZE + 9;
        assert!(buffer.push(&encoded[..split]).unwrap().is_empty());
        let bodies = buffer.push(&encoded[split..]).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(&bodies[0][..], b"a longer body split mid-way");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let encoded = encode_frame(b"hi");

        let mut all = Vec::new();
        for byte in encoded.iter() {
            all.extend(buffer.push(&[*byte]).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(&all[0][..], b"hi");
    }

    #[test]
    fn test_empty_body() {
        let mut buffer = FrameBuffer::new();
        let bodies = buffer.push(&encode_frame(b"")).unwrap();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buffer = FrameBuffer::with_max_frame_size(16);
        let mut prefix = Vec::new();
        prefix.extend_from_slice(&100u32.to_le_bytes());

        let result = buffer.push(&prefix);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let encoded = encode_frame(b"partial");
        buffer.push(&encoded[..LENGTH_PREFIX_SIZE + 2]).unwrap();
        assert!(!buffer.is_empty());

        buffer.clear();
        assert!(buffer.is_empty());

        // Parses a fresh frame cleanly after the reset.
        let bodies = buffer.push(&encode_frame(b"fresh")).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(&bodies[0][..], b"fresh");
    }
}
