//! Payload sinks - the capability set through which stream events reach
//! application code.
//!
//! A sink is owned by exactly one stream for the stream's lifetime; after
//! any terminal event (`on_complete`, `on_error`, `on_cancel`, or
//! `on_next` with `complete`) the stream is reaped and no further calls
//! are made. Sinks run on the connection loop and must not block.

use crate::error::ErrorCode;

/// A stream-terminal error: protocol error code plus UTF-8 error data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    /// Error code from the wire (or synthesized locally).
    pub code: ErrorCode,
    /// Error message.
    pub message: String,
}

impl StreamError {
    /// Create a stream error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// An APPLICATION_ERROR with the given message.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::APPLICATION_ERROR, message)
    }

    /// A REJECTED error with the given message.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::REJECTED, message)
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Receiver of stream events, push-based and single-consumer.
///
/// Requesters pass a sink when opening a stream to observe response
/// traffic; responders return a sink from their request callbacks to
/// observe requester-side traffic (REQUEST_N, CANCEL, and channel
/// payloads).
pub trait PayloadSink: Send + 'static {
    /// A payload element arrived. `complete` marks it as the final one.
    fn on_next(&mut self, payload: crate::frame::Payload, complete: bool);

    /// The remote side completed without a further element.
    fn on_complete(&mut self);

    /// The stream terminated with an error.
    fn on_error(&mut self, error: StreamError);

    /// The remote side canceled the stream.
    fn on_cancel(&mut self) {}

    /// The remote side granted additional demand.
    fn on_request_n(&mut self, _n: u32) {}
}

/// Boxed sink handle as stored in the stream registry.
pub type BoxSink = Box<dyn PayloadSink>;

/// A sink that discards every event.
#[derive(Debug, Default)]
pub struct NoopSink;

impl PayloadSink for NoopSink {
    fn on_next(&mut self, _payload: crate::frame::Payload, _complete: bool) {}
    fn on_complete(&mut self) {}
    fn on_error(&mut self, _error: StreamError) {}
}
