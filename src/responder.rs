//! Responder trait - application callbacks for inbound requests.
//!
//! The connection loop invokes one callback per request initiation. The
//! callback receives the request payload and a [`StreamHandle`] for its
//! outbound half, and returns the [`PayloadSink`] that will observe
//! requester-side events on the stream (REQUEST_N grants, CANCEL, and -
//! for channels - further payloads).
//!
//! Callbacks run on the connection loop and must not block; spawn a task
//! and move the handle into it for long-running work.

use bytes::Bytes;

use crate::frame::Payload;
use crate::requester::StreamHandle;
use crate::sink::{BoxSink, NoopSink, StreamError};

/// Application responder for inbound interactions.
///
/// Every method has a default: payload-less notifications are dropped and
/// stream-opening requests are rejected, so an implementation only
/// overrides the interactions it supports.
pub trait Responder: Send + Sync + 'static {
    /// A fire-and-forget payload arrived. No response is possible.
    fn fire_and_forget(&self, payload: Payload) {
        let _ = payload;
    }

    /// Connection-level metadata arrived.
    fn metadata_push(&self, metadata: Bytes) {
        let _ = metadata;
    }

    /// A request/response interaction arrived. Answer with exactly one
    /// `replies.last(..)` or `replies.error(..)`.
    fn request_response(&self, payload: Payload, replies: StreamHandle) -> BoxSink {
        let _ = payload;
        let _ = replies.error(StreamError::rejected("request_response not supported"));
        Box::new(NoopSink)
    }

    /// A request/stream interaction arrived with `initial_n` demand.
    /// Emit up to the granted demand via `replies`; further grants arrive
    /// through the returned sink's `on_request_n`.
    fn request_stream(&self, payload: Payload, initial_n: u32, replies: StreamHandle) -> BoxSink {
        let _ = (payload, initial_n);
        let _ = replies.error(StreamError::rejected("request_stream not supported"));
        Box::new(NoopSink)
    }

    /// A channel was opened with `initial_n` demand for this side's
    /// emissions. `complete` means the initial payload is the requester's
    /// last; otherwise requester payloads arrive through the returned
    /// sink, subject to demand granted via `replies.request_n(..)`.
    fn request_channel(
        &self,
        payload: Payload,
        initial_n: u32,
        complete: bool,
        replies: StreamHandle,
    ) -> BoxSink {
        let _ = (payload, initial_n, complete);
        let _ = replies.error(StreamError::rejected("request_channel not supported"));
        Box::new(NoopSink)
    }
}

/// A responder that rejects every request and drops every notification.
#[derive(Debug, Default)]
pub struct NoopResponder;

impl Responder for NoopResponder {}
