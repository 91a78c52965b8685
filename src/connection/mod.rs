//! Connection driver: handshake, read loop, dispatch, and close.
//!
//! One tokio task per connection owns every piece of mutable state (frame
//! buffer, stream registry, connection state); this is the "connection
//! loop". Facades and stream handles cross into the loop through an
//! unbounded command channel, outbound frames leave through the dedicated
//! writer task, so wire order equals submission order on the loop.
//!
//! # Lifecycle
//!
//! - [`connect`] sends SETUP as the very first outbound frame, spawns the
//!   loop, and resolves with the [`Requester`] facade.
//! - [`accept`] spawns the loop in the awaiting-setup phase; the
//!   [`ClientAcceptor`] gates the client and builds the responder. While
//!   the acceptor's `initialize` future is pending, inbound frames are
//!   buffered and replayed in arrival order once it resolves.
//!
//! Dispatch: stream 0 frames feed the connection state machine; non-zero
//! stream IDs resolve through the registry to a per-stream state machine.
//! Frames for streams that terminated locally are "late frames" - they
//! are surfaced to diagnostics hooks and otherwise dropped, never errors.

pub mod setup;
pub(crate) mod state;

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant as TokioInstant};

use crate::error::{ErrorCode, RSocketError, Result};
use crate::frame::{Frame, FrameBody, FrameBuffer, Payload};
use crate::requester::{Command, Requester, StreamHandle, StreamOp};
use crate::responder::{NoopResponder, Responder};
use crate::sink::{NoopSink, StreamError};
use crate::stream::{
    Half, InteractionKind, OutEvent, PendingOut, Reassembly, RequestSeed, StreamEntry,
    StreamRegistry,
};
use crate::writer::{spawn_writer, FrameWriter, OutboundFrame, WriterConfig};

pub use setup::{ClientAcceptor, SetupConfig, SetupInfo, SetupRejection};
pub use state::Role;

use self::state::ConnectionState;

/// Diagnostics hook invoked with frames that arrive for already-terminated
/// streams. Must be side-effect-only; it runs on the connection loop.
pub type LateFrameHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Default cap on reassembled logical frames (16 MiB).
pub const DEFAULT_MAX_REASSEMBLY_BYTES: usize = 16 * 1024 * 1024;

/// Connection-level configuration.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Maximum inbound frame size; larger frames kill the connection.
    pub max_frame_size: u32,
    /// Cap on one logical frame reassembled from fragments; exceeding it
    /// cancels the stream.
    pub max_reassembly_bytes: usize,
    /// Cap on concurrent streams accepted from the peer; excess request
    /// initiations are answered with ERROR(REJECTED). `None` = unbounded.
    pub max_concurrent_streams: Option<usize>,
    /// Writer task configuration.
    pub writer: WriterConfig,
    /// Hook for late frames on locally-initiated streams.
    pub requester_late_frame: Option<LateFrameHandler>,
    /// Hook for late frames on remotely-initiated streams.
    pub responder_late_frame: Option<LateFrameHandler>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: crate::frame::buffer::DEFAULT_MAX_FRAME_SIZE,
            max_reassembly_bytes: DEFAULT_MAX_REASSEMBLY_BYTES,
            max_concurrent_streams: None,
            writer: WriterConfig::default(),
            requester_late_frame: None,
            responder_late_frame: None,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("max_frame_size", &self.max_frame_size)
            .field("max_reassembly_bytes", &self.max_reassembly_bytes)
            .field("max_concurrent_streams", &self.max_concurrent_streams)
            .field("writer", &self.writer)
            .field(
                "requester_late_frame",
                &self.requester_late_frame.as_ref().map(|_| "_"),
            )
            .field(
                "responder_late_frame",
                &self.responder_late_frame.as_ref().map(|_| "_"),
            )
            .finish()
    }
}

/// Handle to a running connection loop.
pub struct ConnectionHandle {
    shutdown_rx: oneshot::Receiver<()>,
}

impl ConnectionHandle {
    /// Block until the connection loop exits (transport close, error, or
    /// local close).
    pub async fn wait_for_shutdown(self) -> Result<()> {
        let _ = self.shutdown_rx.await;
        Ok(())
    }
}

/// Open a client connection over `io`.
///
/// SETUP is guaranteed to be the first frame on the wire; any interaction
/// submitted through the returned [`Requester`] is queued behind it. The
/// returned future resolves once SETUP is handed to the writer - setup
/// rejection arrives later as an ERROR on stream 0, which closes the
/// connection and fans a synthetic error out to every live stream.
pub async fn connect<T>(
    io: T,
    setup: SetupConfig,
    responder: Arc<dyn Responder>,
    config: ConnectionConfig,
) -> Result<(Requester, ConnectionHandle)>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    setup.validate()?;
    let (read_half, write_half) = tokio::io::split(io);
    let (writer, _writer_task) = spawn_writer(write_half, config.writer.clone());

    // First outbound frame on the connection, before the loop starts.
    writer
        .send(OutboundFrame::new(setup.to_frame().encode()?))
        .await?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let requester = Requester::new(cmd_tx.clone());
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let connection = Connection {
        state: ConnectionState::new(Role::Client, setup.keepalive_interval, setup.max_lifetime),
        registry: StreamRegistry::new(Role::Client),
        buffer: FrameBuffer::with_max_frame_size(config.max_frame_size),
        config,
        writer,
        reader: read_half,
        commands: cmd_rx,
        cmd_tx,
        responder,
    };
    tokio::spawn(connection.run(None, shutdown_tx));

    Ok((requester, ConnectionHandle { shutdown_rx }))
}

/// Accept a server connection over `io`.
///
/// Spawns the connection loop in the awaiting-setup phase; `acceptor`
/// gates the client and supplies the responder. Must be called within a
/// tokio runtime.
pub fn accept<T, A>(io: T, acceptor: A, config: ConnectionConfig) -> ConnectionHandle
where
    T: AsyncRead + AsyncWrite + Send + 'static,
    A: ClientAcceptor,
{
    let (read_half, write_half) = tokio::io::split(io);
    let (writer, _writer_task) = spawn_writer(write_half, config.writer.clone());

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let connection = Connection {
        state: ConnectionState::new(
            Role::Server,
            setup::DEFAULT_KEEPALIVE_INTERVAL,
            setup::DEFAULT_MAX_LIFETIME,
        ),
        registry: StreamRegistry::new(Role::Server),
        buffer: FrameBuffer::with_max_frame_size(config.max_frame_size),
        config,
        writer,
        reader: read_half,
        commands: cmd_rx,
        cmd_tx,
        responder: Arc::new(NoopResponder),
    };
    tokio::spawn(connection.run(Some(Box::new(acceptor)), shutdown_tx));

    ConnectionHandle { shutdown_rx }
}

/// Loop continuation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Connection<R> {
    config: ConnectionConfig,
    state: ConnectionState,
    registry: StreamRegistry,
    writer: FrameWriter,
    reader: R,
    buffer: FrameBuffer,
    commands: mpsc::UnboundedReceiver<Command>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    responder: Arc<dyn Responder>,
}

impl<R> Connection<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn run(mut self, acceptor: Option<Box<dyn ClientAcceptor>>, tx: oneshot::Sender<()>) {
        match self.drive(acceptor).await {
            Ok(()) => tracing::debug!(
                reason = self.state.close_reason.as_deref().unwrap_or("transport closed"),
                "connection loop finished"
            ),
            Err(e) => tracing::error!("connection loop error: {}", e),
        }
        self.fan_out_close();
        let _ = tx.send(());
    }

    async fn drive(&mut self, acceptor: Option<Box<dyn ClientAcceptor>>) -> Result<()> {
        if let Some(acceptor) = acceptor {
            if self.handshake(acceptor.as_ref()).await? == Flow::Stop {
                return Ok(());
            }
        }

        let period = self.state.keepalive_interval;
        let mut keepalive = interval_at(TokioInstant::now() + period, period);
        let mut read_buf = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    // The loop holds its own sender, so recv never yields None.
                    let Some(command) = command else { return Ok(()) };
                    if self.handle_command(command).await? == Flow::Stop {
                        return Ok(());
                    }
                }
                result = self.reader.read(&mut read_buf) => {
                    let n = result?;
                    if n == 0 {
                        self.state.begin_close("transport closed by peer");
                        return Ok(());
                    }
                    for frame in self.drain_transport(&read_buf[..n]).await? {
                        if self.handle_frame(frame).await? == Flow::Stop {
                            return Ok(());
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if self.on_keepalive_tick().await? == Flow::Stop {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Feed transport bytes through the frame buffer and codec. Any
    /// failure here is fatal: an ERROR goes out on stream 0 and the
    /// error propagates.
    async fn drain_transport(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        let raw_frames = match self.buffer.push(data) {
            Ok(frames) => frames,
            Err(e) => {
                self.send_fatal(format!("{}", e)).await;
                return Err(e);
            }
        };
        let mut frames = Vec::with_capacity(raw_frames.len());
        for raw in raw_frames {
            match Frame::decode(&raw) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => tracing::debug!("discarded ignorable unknown frame"),
                Err(e) => {
                    self.send_fatal(format!("codec error: {}", e)).await;
                    return Err(e.into());
                }
            }
        }
        Ok(frames)
    }

    /// Best-effort ERROR(CONNECTION_ERROR) on stream 0 before shutdown.
    async fn send_fatal(&mut self, message: String) {
        self.state.begin_close(message.clone());
        let _ = Self::send(
            &self.writer,
            &mut self.state,
            Frame::error(0, ErrorCode::CONNECTION_ERROR, message),
        )
        .await;
    }

    async fn send(writer: &FrameWriter, state: &mut ConnectionState, frame: Frame) -> Result<()> {
        let encoded = frame.encode()?;
        writer.send(OutboundFrame::new(encoded)).await?;
        state.stamp_outbound();
        Ok(())
    }

    /// Server handshake: await SETUP, gate it, run initialization while
    /// buffering inbound frames, then replay them in order.
    async fn handshake(&mut self, acceptor: &dyn ClientAcceptor) -> Result<Flow> {
        let mut read_buf = vec![0u8; 64 * 1024];
        let mut pending: VecDeque<Frame> = VecDeque::new();

        let first = loop {
            if let Some(frame) = pending.pop_front() {
                break frame;
            }
            let n = self.reader.read(&mut read_buf).await?;
            if n == 0 {
                return Err(RSocketError::ConnectionClosed);
            }
            pending.extend(self.drain_transport(&read_buf[..n]).await?);
        };
        self.state.stamp_inbound();

        let info = match first.body {
            FrameBody::Setup {
                version,
                keepalive_ms,
                max_lifetime_ms,
                resume_token,
                metadata_mime,
                data_mime,
                honors_lease,
                payload,
            } => {
                if keepalive_ms == 0 || max_lifetime_ms < keepalive_ms {
                    return self
                        .reject_setup(ErrorCode::INVALID_SETUP, "invalid keepalive timing")
                        .await;
                }
                SetupInfo {
                    version,
                    keepalive_interval: std::time::Duration::from_millis(keepalive_ms as u64),
                    max_lifetime: std::time::Duration::from_millis(max_lifetime_ms as u64),
                    resume_token,
                    metadata_mime_type: metadata_mime,
                    data_mime_type: data_mime,
                    honors_lease,
                    payload,
                }
            }
            FrameBody::Resume { .. } => {
                return self
                    .reject_setup(ErrorCode::REJECTED_RESUME, "resumption not supported")
                    .await;
            }
            _ => {
                return self
                    .reject_setup(ErrorCode::INVALID_SETUP, "first frame was not SETUP")
                    .await;
            }
        };

        if let Err(rejection) = acceptor.should_accept(&info) {
            tracing::debug!("client rejected: {}", rejection.message);
            return self.reject_setup(rejection.code, rejection.message).await;
        }

        self.state
            .begin_establishing(info.keepalive_interval, info.max_lifetime);
        let requester = Requester::new(self.cmd_tx.clone());
        let mut init = acceptor.initialize(info, requester);

        // Suspension point: buffer inbound frames, preserving order, until
        // initialization resolves.
        let initialized = loop {
            tokio::select! {
                result = &mut init => break result,
                read = self.reader.read(&mut read_buf) => {
                    let n = read?;
                    if n == 0 {
                        return Err(RSocketError::ConnectionClosed);
                    }
                    pending.extend(self.drain_transport(&read_buf[..n]).await?);
                }
            }
        };
        match initialized {
            Ok(responder) => self.responder = responder,
            Err(e) => {
                return self
                    .reject_setup(
                        ErrorCode::REJECTED_SETUP,
                        format!("initialization failed: {}", e),
                    )
                    .await;
            }
        }
        self.state.activate();
        tracing::debug!(buffered = pending.len(), "connection established");

        // Ordered replay of everything that arrived during the window.
        while let Some(frame) = pending.pop_front() {
            if self.handle_frame(frame).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    async fn reject_setup(
        &mut self,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Result<Flow> {
        let message = message.into();
        self.state.begin_close(format!("setup rejected: {}", message));
        Self::send(
            &self.writer,
            &mut self.state,
            Frame::error(0, code, message),
        )
        .await?;
        Ok(Flow::Stop)
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Flow> {
        self.state.stamp_inbound();
        if frame.stream_id == 0 {
            self.connection_frame(frame).await
        } else {
            self.stream_frame(frame).await
        }
    }

    /// Stream 0 dispatch: the connection state machine.
    async fn connection_frame(&mut self, frame: Frame) -> Result<Flow> {
        match frame.body {
            FrameBody::Keepalive {
                respond,
                last_received_position,
                data,
            } => {
                if respond {
                    // The response must be the next outbound frame, with
                    // the same data.
                    Self::send(
                        &self.writer,
                        &mut self.state,
                        Frame::keepalive(false, last_received_position, data),
                    )
                    .await?;
                }
                Ok(Flow::Continue)
            }
            FrameBody::Error { code, message } => {
                tracing::warn!("connection error from peer: {} {}", code, message);
                self.state
                    .begin_close(format!("peer error {}: {}", code, message));
                Ok(Flow::Stop)
            }
            FrameBody::MetadataPush { metadata } => {
                self.responder.metadata_push(metadata);
                Ok(Flow::Continue)
            }
            FrameBody::Lease {
                ttl_ms,
                number_of_requests,
                ..
            } => {
                // Leases are advisory here; requests are never gated on them.
                tracing::debug!(ttl_ms, number_of_requests, "lease received");
                Ok(Flow::Continue)
            }
            FrameBody::Setup { .. } => {
                self.reject_setup(ErrorCode::INVALID_SETUP, "duplicate SETUP")
                    .await
            }
            FrameBody::Resume { .. } => {
                self.reject_setup(ErrorCode::REJECTED_RESUME, "resumption not supported")
                    .await
            }
            FrameBody::ResumeOk { .. } => {
                self.reject_setup(ErrorCode::CONNECTION_ERROR, "unexpected RESUME_OK")
                    .await
            }
            FrameBody::Ext { extended_type, .. } => {
                tracing::debug!(extended_type, "ignoring extension frame");
                Ok(Flow::Continue)
            }
            other => {
                tracing::warn!("unexpected {} on connection stream", other.frame_type().name());
                Ok(Flow::Continue)
            }
        }
    }

    /// Non-zero stream dispatch: route to the per-stream state machine.
    async fn stream_frame(&mut self, frame: Frame) -> Result<Flow> {
        let id = frame.stream_id;
        if !self.registry.contains(id) {
            return self.on_unmatched(frame).await;
        }
        match frame.body {
            FrameBody::Payload {
                follows,
                complete,
                next,
                payload,
            } => self.on_stream_payload(id, follows, complete, next, payload).await,
            FrameBody::RequestN { n } => self.on_request_n(id, n).await,
            FrameBody::Cancel => {
                if let Some(mut entry) = self.registry.remove(id) {
                    if let Some(sink) = entry.sink.as_mut() {
                        sink.on_cancel();
                    }
                }
                Ok(Flow::Continue)
            }
            FrameBody::Error { code, message } => {
                if let Some(mut entry) = self.registry.remove(id) {
                    if let Some(sink) = entry.sink.as_mut() {
                        sink.on_error(StreamError::new(code, message));
                    }
                }
                Ok(Flow::Continue)
            }
            FrameBody::RequestResponse { .. }
            | FrameBody::RequestFnf { .. }
            | FrameBody::RequestStream { .. }
            | FrameBody::RequestChannel { .. } => {
                self.violation(id, "request initiation on a live stream").await
            }
            other => {
                tracing::warn!("unexpected {} on stream {}", other.frame_type().name(), id);
                Ok(Flow::Continue)
            }
        }
    }

    /// A frame for a stream ID with no registry entry: either a request
    /// initiation that creates one, or a late frame.
    async fn on_unmatched(&mut self, frame: Frame) -> Result<Flow> {
        let id = frame.stream_id;
        if !frame.frame_type().is_request_initiation() {
            self.late_frame(&frame);
            return Ok(Flow::Continue);
        }

        // A request initiation must carry the peer's ID parity.
        if id % 2 != self.registry.peer_parity() {
            tracing::warn!("request initiation with local id parity on stream {}", id);
            Self::send(
                &self.writer,
                &mut self.state,
                Frame::error(id, ErrorCode::INVALID, "stream id parity mismatch"),
            )
            .await?;
            return Ok(Flow::Continue);
        }

        if let Some(max) = self.config.max_concurrent_streams {
            if self.registry.len() >= max {
                Self::send(
                    &self.writer,
                    &mut self.state,
                    Frame::error(id, ErrorCode::REJECTED, "too many concurrent streams"),
                )
                .await?;
                return Ok(Flow::Continue);
            }
        }

        let (kind, initial_n, remote_complete, follows, payload) = match frame.body {
            FrameBody::RequestResponse { follows, payload } => {
                (InteractionKind::RequestResponse, 0, true, follows, payload)
            }
            FrameBody::RequestFnf { follows, payload } => {
                (InteractionKind::FireAndForget, 0, true, follows, payload)
            }
            FrameBody::RequestStream {
                initial_request_n,
                follows,
                payload,
            } => (
                InteractionKind::RequestStream,
                initial_request_n,
                true,
                follows,
                payload,
            ),
            FrameBody::RequestChannel {
                initial_request_n,
                follows,
                complete,
                payload,
            } => (
                InteractionKind::RequestChannel,
                initial_request_n,
                complete,
                follows,
                payload,
            ),
            _ => unreachable!("checked is_request_initiation"),
        };

        if follows {
            let seed = RequestSeed {
                kind,
                initial_n,
                complete: remote_complete,
            };
            match Reassembly::new(payload, true, self.config.max_reassembly_bytes) {
                Ok(reassembly) => {
                    self.registry
                        .insert(id, StreamEntry::reassembling(seed, reassembly));
                    Ok(Flow::Continue)
                }
                Err(_) => {
                    Self::send(
                        &self.writer,
                        &mut self.state,
                        Frame::error(id, ErrorCode::CANCELED, "reassembly cap exceeded"),
                    )
                    .await?;
                    Ok(Flow::Continue)
                }
            }
        } else {
            self.dispatch_request(id, kind, initial_n, remote_complete, payload)
        }
    }

    /// Hand a complete request initiation to the responder.
    fn dispatch_request(
        &mut self,
        id: u32,
        kind: InteractionKind,
        initial_n: u32,
        remote_complete: bool,
        payload: Payload,
    ) -> Result<Flow> {
        if kind == InteractionKind::FireAndForget {
            self.responder.fire_and_forget(payload);
            return Ok(Flow::Continue);
        }

        let entry = StreamEntry::responder(kind, Box::new(NoopSink), initial_n, remote_complete);
        let epoch = self.registry.insert(id, entry);
        let handle = StreamHandle::new(id, epoch, self.cmd_tx.clone());
        let sink = match kind {
            InteractionKind::RequestResponse => self.responder.request_response(payload, handle),
            InteractionKind::RequestStream => {
                self.responder.request_stream(payload, initial_n, handle)
            }
            InteractionKind::RequestChannel => {
                self.responder
                    .request_channel(payload, initial_n, remote_complete, handle)
            }
            InteractionKind::FireAndForget => unreachable!(),
        };
        if let Some(entry) = self.registry.get_mut(id) {
            entry.sink = Some(sink);
        }
        Ok(Flow::Continue)
    }

    async fn on_stream_payload(
        &mut self,
        id: u32,
        follows: bool,
        complete: bool,
        next: bool,
        payload: Payload,
    ) -> Result<Flow> {
        let remote_closed = match self.registry.get_mut(id) {
            Some(entry) => entry.remote == Half::Closed,
            None => return Ok(Flow::Continue),
        };
        if remote_closed {
            self.late_frame(&Frame::new(
                id,
                FrameBody::Payload {
                    follows,
                    complete,
                    next,
                    payload,
                },
            ));
            return Ok(Flow::Continue);
        }

        // Fragment accumulation: FOLLOWS keeps the logical frame open.
        if follows {
            let overflow = {
                let entry = self.registry.get_mut(id).expect("entry checked above");
                match entry.reassembly.as_mut() {
                    Some(reassembly) => reassembly.append(payload).is_err(),
                    None => {
                        match Reassembly::new(payload, next, self.config.max_reassembly_bytes) {
                            Ok(reassembly) => {
                                entry.reassembly = Some(reassembly);
                                false
                            }
                            Err(_) => true,
                        }
                    }
                }
            };
            if overflow {
                return self.violation(id, "reassembly cap exceeded").await;
            }
            return Ok(Flow::Continue);
        }

        // Final fragment: resolve the logical payload and its NEXT flag.
        let finished = {
            let entry = self.registry.get_mut(id).expect("entry checked above");
            match entry.reassembly.take() {
                Some(reassembly) => match reassembly.finish(payload) {
                    Ok((logical, first_next)) => Some((logical, first_next)),
                    Err(_) => None,
                },
                None => Some((payload, next)),
            }
        };
        let Some((payload, next)) = finished else {
            return self.violation(id, "reassembly cap exceeded").await;
        };

        // A reassembled request initiation dispatches to the responder now.
        let seed = self
            .registry
            .get_mut(id)
            .expect("entry checked above")
            .seed
            .take();
        if let Some(seed) = seed {
            if seed.kind == InteractionKind::FireAndForget {
                self.registry.remove(id);
                self.responder.fire_and_forget(payload);
                return Ok(Flow::Continue);
            }
            {
                let entry = self.registry.get_mut(id).expect("entry checked above");
                entry.remote = match seed.kind {
                    InteractionKind::RequestChannel if !seed.complete => Half::Open,
                    _ => Half::Closed,
                };
            }
            return self.dispatch_request_with_existing_entry(id, seed, payload);
        }

        self.deliver_payload(id, payload, next, complete).await
    }

    /// Responder dispatch for an initiation whose (reassembling) entry is
    /// already registered.
    fn dispatch_request_with_existing_entry(
        &mut self,
        id: u32,
        seed: RequestSeed,
        payload: Payload,
    ) -> Result<Flow> {
        let epoch = self
            .registry
            .get_mut(id)
            .expect("entry checked above")
            .epoch;
        let handle = StreamHandle::new(id, epoch, self.cmd_tx.clone());
        let sink = match seed.kind {
            InteractionKind::RequestResponse => self.responder.request_response(payload, handle),
            InteractionKind::RequestStream => {
                self.responder.request_stream(payload, seed.initial_n, handle)
            }
            InteractionKind::RequestChannel => {
                self.responder
                    .request_channel(payload, seed.initial_n, seed.complete, handle)
            }
            InteractionKind::FireAndForget => unreachable!("handled by caller"),
        };
        if let Some(entry) = self.registry.get_mut(id) {
            entry.sink = Some(sink);
        }
        Ok(Flow::Continue)
    }

    /// Deliver one logical payload to the stream's sink, enforcing the
    /// per-kind frame sequence and demand rules.
    async fn deliver_payload(
        &mut self,
        id: u32,
        payload: Payload,
        next: bool,
        complete: bool,
    ) -> Result<Flow> {
        let kind = self.registry.get_mut(id).expect("entry checked above").kind;

        if kind == InteractionKind::RequestResponse {
            // The single response must be NEXT|COMPLETE (or a bare
            // completion); NEXT without COMPLETE is a protocol error.
            if !next && !complete {
                tracing::debug!("payload frame without NEXT or COMPLETE on stream {}", id);
                return Ok(Flow::Continue);
            }
            if next && !complete {
                return self.violation(id, "response payload without COMPLETE").await;
            }
            let mut entry = self.registry.remove(id).expect("entry checked above");
            if let Some(sink) = entry.sink.as_mut() {
                if next {
                    sink.on_next(payload, true);
                } else {
                    sink.on_complete();
                }
            }
            return Ok(Flow::Continue);
        }

        // Stream / channel reception.
        if next {
            let underflow = {
                let entry = self.registry.get_mut(id).expect("entry checked above");
                !entry.consume_inbound()
            };
            if underflow {
                return self.violation(id, "payload beyond granted demand").await;
            }
        } else if !complete {
            tracing::debug!("payload frame without NEXT or COMPLETE on stream {}", id);
            return Ok(Flow::Continue);
        }

        {
            let entry = self.registry.get_mut(id).expect("entry checked above");
            if complete {
                entry.remote = Half::Closed;
                if kind != InteractionKind::RequestChannel {
                    // Request/stream terminals end the whole stream; the
                    // requester's control half dies with it.
                    entry.local = Half::Closed;
                    entry.pending.clear();
                }
            }
            if let Some(sink) = entry.sink.as_mut() {
                if next {
                    sink.on_next(payload, complete);
                } else {
                    sink.on_complete();
                }
            }
        }

        self.reap_if_terminated(id);
        Ok(Flow::Continue)
    }

    async fn on_request_n(&mut self, id: u32, n: u32) -> Result<Flow> {
        if n == 0 {
            tracing::warn!("REQUEST_N with zero demand on stream {}", id);
            return Ok(Flow::Continue);
        }
        let late = {
            let entry = self.registry.get_mut(id).expect("entry checked by caller");
            entry.local == Half::Closed
        };
        if late {
            self.late_frame(&Frame::request_n(id, n));
            return Ok(Flow::Continue);
        }
        {
            let entry = self.registry.get_mut(id).expect("entry checked by caller");
            entry.grant_outbound(n);
            if let Some(sink) = entry.sink.as_mut() {
                sink.on_request_n(n);
            }
        }
        self.flush_stream(id).await
    }

    /// Send queued outbound events permitted by current demand and reap
    /// the stream if that drained it to termination.
    async fn flush_stream(&mut self, id: u32) -> Result<Flow> {
        let events = match self.registry.get_mut(id) {
            Some(entry) => entry.drain_sendable(),
            None => return Ok(Flow::Continue),
        };
        for event in events {
            let frame = match event {
                OutEvent::Next { payload, complete } => Frame::payload_next(id, payload, complete),
                OutEvent::Complete => Frame::payload_complete(id),
            };
            Self::send(&self.writer, &mut self.state, frame).await?;
        }
        self.reap_if_terminated(id);
        Ok(Flow::Continue)
    }

    fn reap_if_terminated(&mut self, id: u32) {
        let terminated = self
            .registry
            .get_mut(id)
            .map(|e| e.is_terminated())
            .unwrap_or(false);
        if terminated {
            self.registry.remove(id);
        }
    }

    /// Stream-level protocol violation: ERROR(CANCELED) on the stream,
    /// terminal for its sink, connection stays up.
    async fn violation(&mut self, id: u32, message: &str) -> Result<Flow> {
        tracing::warn!("protocol violation on stream {}: {}", id, message);
        Self::send(
            &self.writer,
            &mut self.state,
            Frame::error(id, ErrorCode::CANCELED, message),
        )
        .await?;
        if let Some(mut entry) = self.registry.remove(id) {
            if let Some(sink) = entry.sink.as_mut() {
                sink.on_error(StreamError::new(ErrorCode::CANCELED, message));
            }
        }
        Ok(Flow::Continue)
    }

    /// Route a frame for an already-terminated stream to diagnostics.
    /// Late frames are observed, never acted upon, and never errors.
    fn late_frame(&self, frame: &Frame) {
        let local_parity = 1 - self.registry.peer_parity();
        let handler = if frame.stream_id % 2 == local_parity {
            &self.config.requester_late_frame
        } else {
            &self.config.responder_late_frame
        };
        match handler {
            Some(hook) => hook(frame),
            None => tracing::debug!(
                "late {} frame on stream {}",
                frame.frame_type().name(),
                frame.stream_id
            ),
        }
    }

    async fn on_keepalive_tick(&mut self) -> Result<Flow> {
        if self.state.lifetime_exceeded() {
            tracing::warn!("keepalive deadline exceeded, closing connection");
            self.state.begin_close("max lifetime exceeded");
            let _ = Self::send(
                &self.writer,
                &mut self.state,
                Frame::error(0, ErrorCode::CONNECTION_ERROR, "max lifetime exceeded"),
            )
            .await;
            return Ok(Flow::Stop);
        }
        Self::send(
            &self.writer,
            &mut self.state,
            Frame::keepalive(true, 0, Bytes::new()),
        )
        .await?;
        Ok(Flow::Continue)
    }

    async fn handle_command(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::FireAndForget(payload) => {
                let Some(id) = self.registry.allocate() else {
                    return self.on_ids_exhausted().await;
                };
                Self::send(
                    &self.writer,
                    &mut self.state,
                    Frame::new(
                        id,
                        FrameBody::RequestFnf {
                            follows: false,
                            payload,
                        },
                    ),
                )
                .await?;
                Ok(Flow::Continue)
            }
            Command::MetadataPush(metadata) => {
                Self::send(
                    &self.writer,
                    &mut self.state,
                    Frame::metadata_push(metadata),
                )
                .await?;
                Ok(Flow::Continue)
            }
            Command::OpenStream {
                kind,
                payload,
                initial_n,
                complete,
                sink,
                reply,
            } => {
                let Some(id) = self.registry.allocate() else {
                    let _ = reply.send(Err(RSocketError::StreamIdsExhausted));
                    return self.on_ids_exhausted().await;
                };
                let entry = StreamEntry::requester(kind, sink, initial_n, complete);
                let epoch = self.registry.insert(id, entry);
                let frame = match kind {
                    InteractionKind::RequestResponse => Frame::new(
                        id,
                        FrameBody::RequestResponse {
                            follows: false,
                            payload,
                        },
                    ),
                    InteractionKind::RequestStream => Frame::new(
                        id,
                        FrameBody::RequestStream {
                            initial_request_n: initial_n,
                            follows: false,
                            payload,
                        },
                    ),
                    InteractionKind::RequestChannel => Frame::new(
                        id,
                        FrameBody::RequestChannel {
                            initial_request_n: initial_n,
                            follows: false,
                            complete,
                            payload,
                        },
                    ),
                    InteractionKind::FireAndForget => {
                        unreachable!("fire-and-forget does not open a stream")
                    }
                };
                Self::send(&self.writer, &mut self.state, frame).await?;
                let _ = reply.send(Ok(StreamHandle::new(id, epoch, self.cmd_tx.clone())));
                Ok(Flow::Continue)
            }
            Command::StreamOp { id, epoch, op } => self.handle_stream_op(id, epoch, op).await,
            Command::Close => {
                self.state.begin_close("closed locally");
                let _ = Self::send(
                    &self.writer,
                    &mut self.state,
                    Frame::error(0, ErrorCode::CONNECTION_CLOSE, "connection closed"),
                )
                .await;
                Ok(Flow::Stop)
            }
        }
    }

    async fn on_ids_exhausted(&mut self) -> Result<Flow> {
        self.state.begin_close("stream ids exhausted");
        let _ = Self::send(
            &self.writer,
            &mut self.state,
            Frame::error(0, ErrorCode::CONNECTION_ERROR, "stream ids exhausted"),
        )
        .await;
        Ok(Flow::Stop)
    }

    async fn handle_stream_op(&mut self, id: u32, epoch: u64, op: StreamOp) -> Result<Flow> {
        // Stale handles (entry gone or recycled) resolve to no-ops.
        let live = self
            .registry
            .get_mut(id)
            .map(|e| e.epoch == epoch)
            .unwrap_or(false);
        if !live {
            return Ok(Flow::Continue);
        }

        match op {
            StreamOp::Next { payload, complete } => {
                let accepted = {
                    let entry = self.registry.get_mut(id).expect("liveness checked");
                    if !entry.can_emit() || entry.local == Half::Closed {
                        false
                    } else {
                        // A request/response answer always completes.
                        let complete =
                            complete || entry.kind == InteractionKind::RequestResponse;
                        entry.push_pending(PendingOut::Next { payload, complete });
                        true
                    }
                };
                if !accepted {
                    return Ok(Flow::Continue);
                }
                self.flush_stream(id).await
            }
            StreamOp::Complete => {
                let accepted = {
                    let entry = self.registry.get_mut(id).expect("liveness checked");
                    if !entry.can_emit() || entry.local == Half::Closed {
                        false
                    } else {
                        entry.push_pending(PendingOut::Complete);
                        true
                    }
                };
                if !accepted {
                    return Ok(Flow::Continue);
                }
                self.flush_stream(id).await
            }
            StreamOp::Error(error) => {
                Self::send(
                    &self.writer,
                    &mut self.state,
                    Frame::error(id, error.code, error.message.clone()),
                )
                .await?;
                if let Some(mut entry) = self.registry.remove(id) {
                    if let Some(sink) = entry.sink.as_mut() {
                        sink.on_error(error);
                    }
                }
                Ok(Flow::Continue)
            }
            StreamOp::Cancel => {
                Self::send(&self.writer, &mut self.state, Frame::cancel(id)).await?;
                self.registry.remove(id);
                Ok(Flow::Continue)
            }
            StreamOp::RequestN(n) => {
                if n == 0 {
                    return Ok(Flow::Continue);
                }
                {
                    let entry = self.registry.get_mut(id).expect("liveness checked");
                    entry.grant_inbound(n);
                }
                Self::send(&self.writer, &mut self.state, Frame::request_n(id, n)).await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Connection teardown: every live stream gets exactly one synthetic
    /// connection error before the loop exits.
    fn fan_out_close(&mut self) {
        let reason = self
            .state
            .close_reason
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        for mut entry in self.registry.drain_all() {
            if let Some(sink) = entry.sink.as_mut() {
                sink.on_error(StreamError::new(ErrorCode::CONNECTION_ERROR, reason.clone()));
            }
        }
        self.state.closed();
    }
}
