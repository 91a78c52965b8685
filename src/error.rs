//! Error types for rsocket-core.

use thiserror::Error;

/// Protocol error codes carried by ERROR frames.
///
/// The numeric values are fixed by the wire protocol; unknown codes are
/// preserved as-is so they survive a decode/encode round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// The SETUP frame is invalid for the server (e.g. malformed).
    pub const INVALID_SETUP: ErrorCode = ErrorCode(0x0000_0001);
    /// The server does not support some aspect of the SETUP frame.
    pub const UNSUPPORTED_SETUP: ErrorCode = ErrorCode(0x0000_0002);
    /// The server rejected the SETUP; the client should not retry.
    pub const REJECTED_SETUP: ErrorCode = ErrorCode(0x0000_0003);
    /// The server rejected session resumption.
    pub const REJECTED_RESUME: ErrorCode = ErrorCode(0x0000_0004);
    /// The connection is being terminated due to an internal error.
    pub const CONNECTION_ERROR: ErrorCode = ErrorCode(0x0000_0101);
    /// The connection is being closed gracefully.
    pub const CONNECTION_CLOSE: ErrorCode = ErrorCode(0x0000_0102);
    /// Application-layer error terminating an individual stream.
    pub const APPLICATION_ERROR: ErrorCode = ErrorCode(0x0000_0201);
    /// The responder rejected the request without processing it.
    pub const REJECTED: ErrorCode = ErrorCode(0x0000_0202);
    /// The request was canceled before completion.
    pub const CANCELED: ErrorCode = ErrorCode(0x0000_0203);
    /// The request was invalid for the responder.
    pub const INVALID: ErrorCode = ErrorCode(0x0000_0204);

    /// Human-readable name for known codes.
    pub fn name(&self) -> &'static str {
        match *self {
            ErrorCode::INVALID_SETUP => "INVALID_SETUP",
            ErrorCode::UNSUPPORTED_SETUP => "UNSUPPORTED_SETUP",
            ErrorCode::REJECTED_SETUP => "REJECTED_SETUP",
            ErrorCode::REJECTED_RESUME => "REJECTED_RESUME",
            ErrorCode::CONNECTION_ERROR => "CONNECTION_ERROR",
            ErrorCode::CONNECTION_CLOSE => "CONNECTION_CLOSE",
            ErrorCode::APPLICATION_ERROR => "APPLICATION_ERROR",
            ErrorCode::REJECTED => "REJECTED",
            ErrorCode::CANCELED => "CANCELED",
            ErrorCode::INVALID => "INVALID",
            _ => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:08X})", self.name(), self.0)
    }
}

/// Errors produced by the frame codec.
///
/// Any codec error on inbound traffic is fatal at the connection level:
/// the connection answers with ERROR(CONNECTION_ERROR) on stream 0 and
/// shuts down.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer is shorter than the frame header or a declared field.
    #[error("insufficient bytes for frame")]
    InsufficientBytes,

    /// The frame header is malformed.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The stream ID is illegal for the frame type.
    #[error("invalid stream id {stream_id} for {frame_type}")]
    InvalidStreamId {
        /// The offending stream ID.
        stream_id: u32,
        /// Name of the frame type it was paired with.
        frame_type: &'static str,
    },

    /// The frame type code is unknown and the IGNORE flag is not set.
    #[error("unsupported frame type: 0x{0:02X}")]
    UnsupportedFrameType(u8),

    /// A metadata length prefix points past the end of the frame.
    #[error("metadata length exceeds frame body")]
    InvalidMetadataLength,
}

/// Main error type for all rsocket-core operations.
#[derive(Debug, Error)]
pub enum RSocketError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encode/decode error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Protocol violation (illegal frame sequence, malformed handshake, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer terminated the connection or rejected the setup with an
    /// ERROR frame on stream 0.
    #[error("peer error {code}: {message}")]
    Peer {
        /// Error code from the wire.
        code: ErrorCode,
        /// UTF-8 error data from the wire.
        message: String,
    },

    /// The 31-bit stream ID space is exhausted.
    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    /// The connection is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - outbound frame queue full.
    #[error("backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using RSocketError.
pub type Result<T> = std::result::Result<T, RSocketError>;
