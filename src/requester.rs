//! Requester facade and per-stream handles.
//!
//! The [`Requester`] is the application's entry point for initiating
//! interactions on a connection. It is a cheap handle around the
//! connection loop's command channel: every method submits a command that
//! the loop executes on its own task, so all stream bookkeeping stays
//! single-threaded.
//!
//! Stream-opening methods resolve to a [`StreamHandle`] once the loop has
//! allocated a stream ID and sent the request frame. Handles carry the
//! stream ID plus an epoch tag; a handle that outlives its stream becomes
//! a no-op rather than touching a recycled entry.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::{RSocketError, Result};
use crate::frame::Payload;
use crate::sink::{BoxSink, StreamError};
use crate::stream::InteractionKind;

/// Commands submitted into the connection loop.
pub(crate) enum Command {
    /// Send a REQUEST_FNF frame.
    FireAndForget(Payload),
    /// Send a METADATA_PUSH frame.
    MetadataPush(Bytes),
    /// Allocate a stream, send its request frame, reply with the handle.
    OpenStream {
        kind: InteractionKind,
        payload: Payload,
        initial_n: u32,
        complete: bool,
        sink: BoxSink,
        reply: oneshot::Sender<Result<StreamHandle>>,
    },
    /// An operation on a live stream.
    StreamOp { id: u32, epoch: u64, op: StreamOp },
    /// Close the connection gracefully.
    Close,
}

/// Operations a handle may perform on its stream.
pub(crate) enum StreamOp {
    /// Emit a payload element, optionally completing.
    Next { payload: Payload, complete: bool },
    /// Complete without a further element.
    Complete,
    /// Terminate the stream with an error.
    Error(StreamError),
    /// Cancel the stream.
    Cancel,
    /// Grant additional demand to the remote side.
    RequestN(u32),
}

/// Application-facing requester for a connection.
///
/// Cloneable; all clones feed the same connection loop.
#[derive(Clone)]
pub struct Requester {
    tx: mpsc::UnboundedSender<Command>,
}

impl Requester {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| RSocketError::ConnectionClosed)
    }

    /// Send a payload with no response expected. The stream is complete
    /// as soon as the frame is sent.
    pub fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        self.submit(Command::FireAndForget(payload))
    }

    /// Push metadata on the connection stream.
    pub fn metadata_push(&self, metadata: Bytes) -> Result<()> {
        self.submit(Command::MetadataPush(metadata))
    }

    /// Request a single response. The sink receives exactly one
    /// `on_next(_, complete = true)` or one `on_error`.
    pub async fn request_response(&self, payload: Payload, sink: BoxSink) -> Result<StreamHandle> {
        self.open(InteractionKind::RequestResponse, payload, 1, true, sink)
            .await
    }

    /// Request a stream of payloads with the given initial demand.
    pub async fn request_stream(
        &self,
        payload: Payload,
        initial_n: u32,
        sink: BoxSink,
    ) -> Result<StreamHandle> {
        self.open(InteractionKind::RequestStream, payload, initial_n, true, sink)
            .await
    }

    /// Open a bidirectional channel. `complete` marks the initial payload
    /// as the requester's last; otherwise further payloads are sent
    /// through the returned handle, subject to responder demand.
    pub async fn request_channel(
        &self,
        payload: Payload,
        initial_n: u32,
        complete: bool,
        sink: BoxSink,
    ) -> Result<StreamHandle> {
        self.open(
            InteractionKind::RequestChannel,
            payload,
            initial_n,
            complete,
            sink,
        )
        .await
    }

    /// Close the connection gracefully. All live streams receive a
    /// synthetic connection error.
    pub fn close(&self) {
        let _ = self.submit(Command::Close);
    }

    async fn open(
        &self,
        kind: InteractionKind,
        payload: Payload,
        initial_n: u32,
        complete: bool,
        sink: BoxSink,
    ) -> Result<StreamHandle> {
        let (reply, reply_rx) = oneshot::channel();
        self.submit(Command::OpenStream {
            kind,
            payload,
            initial_n,
            complete,
            sink,
            reply,
        })?;
        reply_rx.await.map_err(|_| RSocketError::ConnectionClosed)?
    }
}

/// Handle to one live stream, held by the side that may emit on it.
///
/// All operations are submitted to the connection loop; a handle whose
/// stream has terminated (epoch mismatch or entry gone) is a no-op.
#[derive(Clone)]
pub struct StreamHandle {
    id: u32,
    epoch: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl StreamHandle {
    pub(crate) fn new(id: u32, epoch: u64, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { id, epoch, tx }
    }

    /// The stream ID this handle is bound to.
    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.id
    }

    fn op(&self, op: StreamOp) -> Result<()> {
        self.tx
            .send(Command::StreamOp {
                id: self.id,
                epoch: self.epoch,
                op,
            })
            .map_err(|_| RSocketError::ConnectionClosed)
    }

    /// Emit one payload element. Queued locally while granted demand is
    /// zero and flushed by incoming REQUEST_N.
    pub fn next(&self, payload: Payload) -> Result<()> {
        self.op(StreamOp::Next {
            payload,
            complete: false,
        })
    }

    /// Emit one payload element and complete the local half.
    pub fn last(&self, payload: Payload) -> Result<()> {
        self.op(StreamOp::Next {
            payload,
            complete: true,
        })
    }

    /// Complete the local half without a further element.
    pub fn complete(&self) -> Result<()> {
        self.op(StreamOp::Complete)
    }

    /// Terminate the stream with an error.
    pub fn error(&self, error: StreamError) -> Result<()> {
        self.op(StreamOp::Error(error))
    }

    /// Cancel the stream. Idempotent; later inbound frames on the stream
    /// are late frames.
    pub fn cancel(&self) -> Result<()> {
        self.op(StreamOp::Cancel)
    }

    /// Grant the remote side `n` additional payload elements.
    pub fn request_n(&self, n: u32) -> Result<()> {
        self.op(StreamOp::RequestN(n))
    }
}
