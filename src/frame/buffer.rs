//! Frame buffer for accumulating partial transport reads.
//!
//! Stream transports carry a 24-bit big-endian length prefix (3 bytes)
//! before each frame; the prefix is not part of the frame octets. This
//! buffer accumulates raw bytes and yields whole frames, using
//! `bytes::BytesMut` for zero-copy buffer management and a small state
//! machine for fragmented reads:
//! - `WaitingForLength`: need the 3-byte prefix
//! - `WaitingForFrame`: prefix parsed, need N more frame bytes

use bytes::{Bytes, BytesMut};

use super::payload::MAX_U24;
use crate::error::{RSocketError, Result};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 3;

/// Default maximum frame size (the 24-bit prefix ceiling).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = MAX_U24;

/// State machine for frame extraction.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for the complete 3-byte length prefix.
    WaitingForLength,
    /// Prefix parsed, waiting for the frame bytes.
    WaitingForFrame { length: usize },
}

/// Buffer for accumulating incoming bytes and extracting whole frames.
///
/// All data is stored in a single `BytesMut` buffer to minimize
/// allocations; extracted frames are zero-copy slices of it.
pub struct FrameBuffer {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed frame size.
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom max frame size.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state: State::WaitingForLength,
            max_frame_size: max_frame_size.min(MAX_U24),
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns the whole-frame octet sequences (prefix stripped), in
    /// arrival order; partial data is buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns an error if a prefix declares a frame larger than the
    /// configured maximum; this is fatal for the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            State::WaitingForLength => {
                if self.buffer.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let length = ((self.buffer[0] as u32) << 16)
                    | ((self.buffer[1] as u32) << 8)
                    | self.buffer[2] as u32;
                if length > self.max_frame_size {
                    return Err(RSocketError::Protocol(format!(
                        "frame size {} exceeds maximum {}",
                        length, self.max_frame_size
                    )));
                }
                let _ = self.buffer.split_to(LENGTH_PREFIX_SIZE);
                self.state = State::WaitingForFrame {
                    length: length as usize,
                };
                self.try_extract_one()
            }
            State::WaitingForFrame { length } => {
                if self.buffer.len() < length {
                    return Ok(None);
                }
                let frame = self.buffer.split_to(length).freeze();
                self.state = State::WaitingForLength;
                Ok(Some(frame))
            }
        }
    }

    /// Number of buffered bytes not yet assembled into a frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no pending bytes.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
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

/// Prepend the 24-bit big-endian length prefix to a frame.
pub fn length_prefix(frame_len: usize) -> [u8; LENGTH_PREFIX_SIZE] {
    debug_assert!(frame_len <= MAX_U24 as usize);
    [
        (frame_len >> 16) as u8,
        (frame_len >> 8) as u8,
        frame_len as u8,
    ]
}
