//! End-to-end connection tests over an in-memory duplex transport.
//!
//! Each test wires a real client and server connection loop together (or
//! a raw frame-level peer where the scenario needs misbehavior) and
//! asserts on the events observed by application sinks and responders.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use rsocket_core::connection::setup::BoxFuture;
use rsocket_core::frame::{Frame, FrameBody, FrameBuffer, Payload};
use rsocket_core::{
    accept, connect, ClientAcceptor, ConnectionConfig, ConnectionHandle, ErrorCode, NoopResponder,
    NoopSink, PayloadSink, Requester, Responder, Result, SetupConfig, SetupInfo, SetupRejection,
    StreamError, StreamHandle, MAX_REQUEST_N,
};

fn payload(data: &[u8]) -> Payload {
    Payload::from_data(Bytes::copy_from_slice(data))
}

fn setup_config() -> SetupConfig {
    SetupConfig::new()
        .keepalive(Duration::from_millis(500))
        .max_lifetime(Duration::from_millis(5000))
        .mime_types("utf8", "utf8")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within deadline"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Events observed by a recording sink.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SinkEvent {
    Next(Vec<u8>, bool),
    Complete,
    Error(u32, String),
    Cancel,
    RequestN(u32),
}

#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<SinkEvent>>>);

impl EventLog {
    fn push(&self, event: SinkEvent) {
        self.0.lock().unwrap().push(event);
    }

    fn snapshot(&self) -> Vec<SinkEvent> {
        self.0.lock().unwrap().clone()
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

struct RecordingSink(EventLog);

impl PayloadSink for RecordingSink {
    fn on_next(&mut self, payload: Payload, complete: bool) {
        self.0.push(SinkEvent::Next(payload.data.to_vec(), complete));
    }

    fn on_complete(&mut self) {
        self.0.push(SinkEvent::Complete);
    }

    fn on_error(&mut self, error: StreamError) {
        self.0.push(SinkEvent::Error(error.code.0, error.message));
    }

    fn on_cancel(&mut self) {
        self.0.push(SinkEvent::Cancel);
    }

    fn on_request_n(&mut self, n: u32) {
        self.0.push(SinkEvent::RequestN(n));
    }
}

fn recording_sink() -> (Box<dyn PayloadSink>, EventLog) {
    let log = EventLog::default();
    (Box::new(RecordingSink(log.clone())), log)
}

/// Connection-level events observed by a recording responder.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ServerEvent {
    MetadataPush(Vec<u8>),
    FireAndForget(Vec<u8>),
}

#[derive(Clone, Default)]
struct ServerLog(Arc<Mutex<Vec<ServerEvent>>>);

impl ServerLog {
    fn push(&self, event: ServerEvent) {
        self.0.lock().unwrap().push(event);
    }

    fn snapshot(&self) -> Vec<ServerEvent> {
        self.0.lock().unwrap().clone()
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

struct RecordingResponder(ServerLog);

impl Responder for RecordingResponder {
    fn fire_and_forget(&self, payload: Payload) {
        self.0.push(ServerEvent::FireAndForget(payload.data.to_vec()));
    }

    fn metadata_push(&self, metadata: Bytes) {
        self.0.push(ServerEvent::MetadataPush(metadata.to_vec()));
    }
}

/// Acceptor that records the SETUP, optionally waits on a gate during
/// initialization, and hands out the server requester.
struct TestAcceptor {
    responder: Arc<dyn Responder>,
    seen: Arc<Mutex<Option<SetupInfo>>>,
    requester: Arc<Mutex<Option<Requester>>>,
    gate: Option<Arc<Notify>>,
}

impl TestAcceptor {
    fn new(responder: Arc<dyn Responder>) -> Self {
        Self {
            responder,
            seen: Arc::new(Mutex::new(None)),
            requester: Arc::new(Mutex::new(None)),
            gate: None,
        }
    }

    fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl ClientAcceptor for TestAcceptor {
    fn should_accept(&self, info: &SetupInfo) -> std::result::Result<(), SetupRejection> {
        *self.seen.lock().unwrap() = Some(info.clone());
        Ok(())
    }

    fn initialize(
        &self,
        _info: SetupInfo,
        requester: Requester,
    ) -> BoxFuture<'static, Result<Arc<dyn Responder>>> {
        *self.requester.lock().unwrap() = Some(requester);
        let responder = self.responder.clone();
        let gate = self.gate.clone();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            Ok(responder)
        })
    }
}

struct RejectingAcceptor;

impl ClientAcceptor for RejectingAcceptor {
    fn should_accept(&self, _info: &SetupInfo) -> std::result::Result<(), SetupRejection> {
        Err(SetupRejection::rejected("not today"))
    }

    fn initialize(
        &self,
        _info: SetupInfo,
        _requester: Requester,
    ) -> BoxFuture<'static, Result<Arc<dyn Responder>>> {
        unreachable!("rejected connections are never initialized")
    }
}

/// Frame-level peer for scenarios that need raw wire control.
struct RawPeer {
    io: DuplexStream,
    buffer: FrameBuffer,
    queue: VecDeque<Frame>,
}

impl RawPeer {
    fn new(io: DuplexStream) -> Self {
        Self {
            io,
            buffer: FrameBuffer::new(),
            queue: VecDeque::new(),
        }
    }

    async fn send(&mut self, frame: Frame) {
        let encoded = frame.encode().unwrap();
        let len = encoded.len();
        let mut bytes = Vec::with_capacity(3 + len);
        bytes.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
        bytes.extend_from_slice(&encoded);
        self.io.write_all(&bytes).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        let deadline = Duration::from_secs(2);
        tokio::time::timeout(deadline, async {
            loop {
                if let Some(frame) = self.queue.pop_front() {
                    return frame;
                }
                let mut tmp = [0u8; 4096];
                let n = self.io.read(&mut tmp).await.unwrap();
                assert!(n > 0, "peer closed the transport");
                for raw in self.buffer.push(&tmp[..n]).unwrap() {
                    if let Some(frame) = Frame::decode(&raw).unwrap() {
                        self.queue.push_back(frame);
                    }
                }
            }
        })
        .await
        .expect("no frame within deadline")
    }

    /// Receive the next non-KEEPALIVE frame.
    async fn recv_data(&mut self) -> Frame {
        loop {
            let frame = self.recv().await;
            if !matches!(frame.body, FrameBody::Keepalive { .. }) {
                return frame;
            }
        }
    }
}

async fn connected(
    server_responder: Arc<dyn Responder>,
    client_responder: Arc<dyn Responder>,
) -> (Requester, ConnectionHandle, ConnectionHandle) {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let acceptor = TestAcceptor::new(server_responder);
    let server = accept(server_io, acceptor, ConnectionConfig::default());
    let (requester, client) = connect(
        client_io,
        setup_config(),
        client_responder,
        ConnectionConfig::default(),
    )
    .await
    .unwrap();
    (requester, client, server)
}

// --- Scenario S1: client setup accepted -------------------------------

#[tokio::test]
async fn s1_client_setup_accepted() {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let acceptor = TestAcceptor::new(Arc::new(NoopResponder));
    let seen = acceptor.seen.clone();
    let _server = accept(server_io, acceptor, ConnectionConfig::default());

    let (_requester, _client) = connect(
        client_io,
        setup_config(),
        Arc::new(NoopResponder),
        ConnectionConfig::default(),
    )
    .await
    .unwrap();

    wait_until(|| seen.lock().unwrap().is_some()).await;
    let info = seen.lock().unwrap().clone().unwrap();
    assert_eq!(info.keepalive_interval, Duration::from_millis(500));
    assert_eq!(info.max_lifetime, Duration::from_millis(5000));
    assert_eq!(info.metadata_mime_type, "utf8");
    assert_eq!(info.data_mime_type, "utf8");
    assert!(info.payload.is_empty());
    assert!(!info.honors_lease);
}

// --- Scenario S2: metadata push ---------------------------------------

#[tokio::test]
async fn s2_metadata_push() {
    let log = ServerLog::default();
    let (requester, _client, _server) = connected(
        Arc::new(RecordingResponder(log.clone())),
        Arc::new(NoopResponder),
    )
    .await;

    requester
        .metadata_push(Bytes::from_static(b"Hello World"))
        .unwrap();

    wait_until(|| log.len() == 1).await;
    assert_eq!(
        log.snapshot(),
        vec![ServerEvent::MetadataPush(b"Hello World".to_vec())]
    );
}

// --- Scenario S3: fire-and-forget -------------------------------------

#[tokio::test]
async fn s3_fire_and_forget() {
    let log = ServerLog::default();
    let (requester, _client, _server) = connected(
        Arc::new(RecordingResponder(log.clone())),
        Arc::new(NoopResponder),
    )
    .await;

    requester.fire_and_forget(payload(b"Hello World")).unwrap();

    wait_until(|| log.len() == 1).await;
    assert_eq!(
        log.snapshot(),
        vec![ServerEvent::FireAndForget(b"Hello World".to_vec())]
    );
}

// --- Scenario S4: request/response echo --------------------------------

struct EchoResponder;

impl Responder for EchoResponder {
    fn request_response(&self, payload: Payload, replies: StreamHandle) -> Box<dyn PayloadSink> {
        replies.last(payload).unwrap();
        Box::new(NoopSink)
    }
}

#[tokio::test]
async fn s4_request_response_echo() {
    let (requester, _client, _server) =
        connected(Arc::new(EchoResponder), Arc::new(NoopResponder)).await;

    let (sink, events) = recording_sink();
    let _handle = requester
        .request_response(payload(b"Hello World"), sink)
        .await
        .unwrap();

    wait_until(|| events.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        events.snapshot(),
        vec![SinkEvent::Next(b"Hello World".to_vec(), true)]
    );
}

// --- Scenario S5: request/stream seven-chunk ---------------------------

struct SevenChunkResponder;

impl Responder for SevenChunkResponder {
    fn request_stream(
        &self,
        _payload: Payload,
        _initial_n: u32,
        replies: StreamHandle,
    ) -> Box<dyn PayloadSink> {
        for chunk in [&b"Hello"[..], b" ", b"W", b"o", b"r", b"l"] {
            replies.next(payload(chunk)).unwrap();
        }
        replies.last(payload(b"d")).unwrap();
        Box::new(NoopSink)
    }
}

#[tokio::test]
async fn s5_request_stream_seven_chunks() {
    let (requester, _client, _server) =
        connected(Arc::new(SevenChunkResponder), Arc::new(NoopResponder)).await;

    let (sink, events) = recording_sink();
    let _handle = requester
        .request_stream(payload(b"Hello World!"), MAX_REQUEST_N, sink)
        .await
        .unwrap();

    wait_until(|| events.len() == 7).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        events.snapshot(),
        vec![
            SinkEvent::Next(b"Hello".to_vec(), false),
            SinkEvent::Next(b" ".to_vec(), false),
            SinkEvent::Next(b"W".to_vec(), false),
            SinkEvent::Next(b"o".to_vec(), false),
            SinkEvent::Next(b"r".to_vec(), false),
            SinkEvent::Next(b"l".to_vec(), false),
            SinkEvent::Next(b"d".to_vec(), true),
        ]
    );
}

// --- Scenario S6: channel echo with mid-stream requester sends ---------

/// Echoes the initial payload and every subsequent requester payload;
/// completes when the requester completes.
struct ChannelEchoResponder;

struct ChannelEchoSink {
    replies: StreamHandle,
}

impl PayloadSink for ChannelEchoSink {
    fn on_next(&mut self, payload: Payload, complete: bool) {
        let _ = self.replies.next(payload);
        if complete {
            let _ = self.replies.complete();
        }
    }

    fn on_complete(&mut self) {
        let _ = self.replies.complete();
    }

    fn on_error(&mut self, _error: StreamError) {}
}

impl Responder for ChannelEchoResponder {
    fn request_channel(
        &self,
        payload: Payload,
        _initial_n: u32,
        _complete: bool,
        replies: StreamHandle,
    ) -> Box<dyn PayloadSink> {
        replies.request_n(MAX_REQUEST_N).unwrap();
        replies.next(payload).unwrap();
        Box::new(ChannelEchoSink { replies })
    }
}

#[tokio::test]
async fn s6_channel_echo_with_mid_stream_sends() {
    let (requester, _client, _server) =
        connected(Arc::new(ChannelEchoResponder), Arc::new(NoopResponder)).await;

    let (sink, events) = recording_sink();
    let handle = requester
        .request_channel(payload(b"Hello"), MAX_REQUEST_N, false, sink)
        .await
        .unwrap();

    for chunk in [&b" "[..], b"W", b"o", b"r", b"l", b"d"] {
        handle.next(payload(chunk)).unwrap();
    }
    handle.complete().unwrap();

    wait_until(|| events.len() == 8).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        events.snapshot(),
        vec![
            SinkEvent::Next(b"Hello".to_vec(), false),
            SinkEvent::Next(b" ".to_vec(), false),
            SinkEvent::Next(b"W".to_vec(), false),
            SinkEvent::Next(b"o".to_vec(), false),
            SinkEvent::Next(b"r".to_vec(), false),
            SinkEvent::Next(b"l".to_vec(), false),
            SinkEvent::Next(b"d".to_vec(), false),
            SinkEvent::Complete,
        ]
    );
}

// --- Scenario S7: application error mid-stream -------------------------

struct MidStreamErrorResponder;

impl Responder for MidStreamErrorResponder {
    fn request_stream(
        &self,
        _payload: Payload,
        _initial_n: u32,
        replies: StreamHandle,
    ) -> Box<dyn PayloadSink> {
        replies.next(payload(b"Hello")).unwrap();
        replies
            .error(StreamError::application("enough for today"))
            .unwrap();
        Box::new(NoopSink)
    }
}

#[tokio::test]
async fn s7_application_error_mid_stream() {
    let (requester, _client, _server) =
        connected(Arc::new(MidStreamErrorResponder), Arc::new(NoopResponder)).await;

    let (sink, events) = recording_sink();
    let _handle = requester
        .request_stream(payload(b"Hello World!"), MAX_REQUEST_N, sink)
        .await
        .unwrap();

    wait_until(|| events.len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        events.snapshot(),
        vec![
            SinkEvent::Next(b"Hello".to_vec(), false),
            SinkEvent::Error(ErrorCode::APPLICATION_ERROR.0, "enough for today".to_string()),
        ]
    );
}

// --- Property: stream-ID parity ----------------------------------------

#[tokio::test]
async fn client_ids_odd_server_ids_even() {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let acceptor = TestAcceptor::new(Arc::new(NoopResponder));
    let server_requester = acceptor.requester.clone();
    let _server = accept(server_io, acceptor, ConnectionConfig::default());

    let (requester, _client) = connect(
        client_io,
        setup_config(),
        Arc::new(EchoResponder),
        ConnectionConfig::default(),
    )
    .await
    .unwrap();

    // Client-minted IDs are odd and monotonic.
    let (sink1, _events1) = recording_sink();
    let h1 = requester.request_response(payload(b"a"), sink1).await.unwrap();
    let (sink2, _events2) = recording_sink();
    let h2 = requester.request_response(payload(b"b"), sink2).await.unwrap();
    assert_eq!(h1.stream_id(), 1);
    assert_eq!(h2.stream_id(), 3);

    // Server-minted IDs are even; the client's responder echoes back.
    wait_until(|| server_requester.lock().unwrap().is_some()).await;
    let server_side = server_requester.lock().unwrap().clone().unwrap();
    let (sink3, events3) = recording_sink();
    let h3 = server_side
        .request_response(payload(b"from server"), sink3)
        .await
        .unwrap();
    assert_eq!(h3.stream_id(), 2);

    wait_until(|| events3.len() == 1).await;
    assert_eq!(
        events3.snapshot(),
        vec![SinkEvent::Next(b"from server".to_vec(), true)]
    );
}

// --- Property: demand safety -------------------------------------------

/// Submits five elements immediately; only granted demand may reach the
/// wire.
struct BurstStreamResponder;

impl Responder for BurstStreamResponder {
    fn request_stream(
        &self,
        _payload: Payload,
        _initial_n: u32,
        replies: StreamHandle,
    ) -> Box<dyn PayloadSink> {
        for chunk in [&b"a"[..], b"b", b"c", b"d"] {
            replies.next(payload(chunk)).unwrap();
        }
        replies.last(payload(b"e")).unwrap();
        Box::new(NoopSink)
    }
}

#[tokio::test]
async fn demand_gates_stream_emissions() {
    let (requester, _client, _server) =
        connected(Arc::new(BurstStreamResponder), Arc::new(NoopResponder)).await;

    let (sink, events) = recording_sink();
    let handle = requester
        .request_stream(payload(b"go"), 2, sink)
        .await
        .unwrap();

    // Only the initial grant of two may arrive.
    wait_until(|| events.len() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        events.snapshot(),
        vec![
            SinkEvent::Next(b"a".to_vec(), false),
            SinkEvent::Next(b"b".to_vec(), false),
        ]
    );

    // Granting the rest releases the queued elements and the completion.
    handle.request_n(3).unwrap();
    wait_until(|| events.len() == 5).await;
    assert_eq!(
        events.snapshot(),
        vec![
            SinkEvent::Next(b"a".to_vec(), false),
            SinkEvent::Next(b"b".to_vec(), false),
            SinkEvent::Next(b"c".to_vec(), false),
            SinkEvent::Next(b"d".to_vec(), false),
            SinkEvent::Next(b"e".to_vec(), true),
        ]
    );
}

// --- Property: terminal exactness / cancel idempotence -----------------

struct SilentStreamResponder(EventLog);

impl Responder for SilentStreamResponder {
    fn request_stream(
        &self,
        _payload: Payload,
        _initial_n: u32,
        _replies: StreamHandle,
    ) -> Box<dyn PayloadSink> {
        Box::new(RecordingSink(self.0.clone()))
    }
}

#[tokio::test]
async fn cancel_is_idempotent_and_terminal() {
    let server_events = EventLog::default();
    let (requester, _client, _server) = connected(
        Arc::new(SilentStreamResponder(server_events.clone())),
        Arc::new(NoopResponder),
    )
    .await;

    let (sink, client_events) = recording_sink();
    let handle = requester
        .request_stream(payload(b"go"), 8, sink)
        .await
        .unwrap();

    handle.cancel().unwrap();
    handle.cancel().unwrap(); // stale handle, must be a no-op

    wait_until(|| {
        server_events
            .snapshot()
            .iter()
            .any(|e| *e == SinkEvent::Cancel)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Exactly one terminal event on the responder side, none on the
    // requester side (cancellation was locally initiated).
    let cancels = server_events
        .snapshot()
        .iter()
        .filter(|e| **e == SinkEvent::Cancel)
        .count();
    assert_eq!(cancels, 1);
    assert!(client_events.snapshot().is_empty());
}

// --- Property: keepalive responsiveness --------------------------------

#[tokio::test]
async fn keepalive_respond_echoes_data_as_next_frame() {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let mut peer = RawPeer::new(server_io);

    let quiet = SetupConfig::new()
        .keepalive(Duration::from_secs(3600))
        .max_lifetime(Duration::from_secs(7200))
        .mime_types("utf8", "utf8");
    let (_requester, _client) = connect(
        client_io,
        quiet,
        Arc::new(NoopResponder),
        ConnectionConfig::default(),
    )
    .await
    .unwrap();

    // First frame on the wire is SETUP.
    let first = peer.recv().await;
    assert!(matches!(first.body, FrameBody::Setup { .. }));

    peer.send(Frame::keepalive(true, 7, Bytes::from_static(b"ping")))
        .await;

    let response = peer.recv().await;
    match response.body {
        FrameBody::Keepalive { respond, data, .. } => {
            assert!(!respond);
            assert_eq!(&data[..], b"ping");
        }
        other => panic!("expected KEEPALIVE response, got {:?}", other),
    }
}

// --- Property: protocol violation answered with ERROR(CANCELED) --------

#[tokio::test]
async fn response_without_complete_cancels_stream() {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let mut peer = RawPeer::new(server_io);

    let quiet = SetupConfig::new()
        .keepalive(Duration::from_secs(3600))
        .max_lifetime(Duration::from_secs(7200))
        .mime_types("utf8", "utf8");
    let (requester, _client) = connect(
        client_io,
        quiet,
        Arc::new(NoopResponder),
        ConnectionConfig::default(),
    )
    .await
    .unwrap();

    let setup = peer.recv().await;
    assert!(matches!(setup.body, FrameBody::Setup { .. }));

    let (sink, events) = recording_sink();
    let handle = requester.request_response(payload(b"hi"), sink).await.unwrap();
    let request = peer.recv_data().await;
    assert_eq!(request.stream_id, handle.stream_id());
    assert!(matches!(request.body, FrameBody::RequestResponse { .. }));

    // Answer with NEXT but no COMPLETE: illegal for request/response.
    peer.send(Frame::payload_next(handle.stream_id(), payload(b"partial"), false))
        .await;

    // The stream dies with CANCELED locally and on the wire.
    let error = peer.recv_data().await;
    assert_eq!(error.stream_id, handle.stream_id());
    match error.body {
        FrameBody::Error { code, .. } => assert_eq!(code, ErrorCode::CANCELED),
        other => panic!("expected ERROR, got {:?}", other),
    }
    wait_until(|| events.len() == 1).await;
    match &events.snapshot()[0] {
        SinkEvent::Error(code, _) => assert_eq!(*code, ErrorCode::CANCELED.0),
        other => panic!("expected error event, got {:?}", other),
    }
}

// --- Property: setup deferral ------------------------------------------

#[tokio::test]
async fn frames_during_initialization_are_deferred_in_order() {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let gate = Arc::new(Notify::new());
    let log = ServerLog::default();
    let acceptor =
        TestAcceptor::new(Arc::new(RecordingResponder(log.clone()))).gated(gate.clone());
    let _server = accept(server_io, acceptor, ConnectionConfig::default());

    let (requester, _client) = connect(
        client_io,
        setup_config(),
        Arc::new(NoopResponder),
        ConnectionConfig::default(),
    )
    .await
    .unwrap();

    requester.metadata_push(Bytes::from_static(b"first")).unwrap();
    requester.fire_and_forget(payload(b"second")).unwrap();

    // Nothing may reach the responder while initialization is pending.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(log.len(), 0);

    gate.notify_one();
    wait_until(|| log.len() == 2).await;
    assert_eq!(
        log.snapshot(),
        vec![
            ServerEvent::MetadataPush(b"first".to_vec()),
            ServerEvent::FireAndForget(b"second".to_vec()),
        ]
    );
}

// --- Setup rejection ----------------------------------------------------

#[tokio::test]
async fn rejected_setup_closes_connection_and_fans_out() {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = accept(server_io, RejectingAcceptor, ConnectionConfig::default());

    let (requester, client) = connect(
        client_io,
        setup_config(),
        Arc::new(NoopResponder),
        ConnectionConfig::default(),
    )
    .await
    .unwrap();

    let (sink, events) = recording_sink();
    let _ = requester.request_response(payload(b"hi"), sink).await;

    server.wait_for_shutdown().await.unwrap();
    client.wait_for_shutdown().await.unwrap();

    // Any stream that was live gets exactly one synthetic error.
    let snapshot = events.snapshot();
    if !snapshot.is_empty() {
        assert_eq!(snapshot.len(), 1);
        match &snapshot[0] {
            SinkEvent::Error(code, _) => assert_eq!(*code, ErrorCode::CONNECTION_ERROR.0),
            other => panic!("expected synthetic error, got {:?}", other),
        }
    }
}

// --- Graceful local close ----------------------------------------------

#[tokio::test]
async fn local_close_sends_connection_close_and_cancels_streams() {
    let server_events = EventLog::default();
    let (requester, client, _server) = connected(
        Arc::new(SilentStreamResponder(server_events.clone())),
        Arc::new(NoopResponder),
    )
    .await;

    let (sink, client_events) = recording_sink();
    let _handle = requester
        .request_stream(payload(b"go"), 4, sink)
        .await
        .unwrap();

    requester.close();
    client.wait_for_shutdown().await.unwrap();

    wait_until(|| client_events.len() == 1).await;
    match &client_events.snapshot()[0] {
        SinkEvent::Error(code, _) => assert_eq!(*code, ErrorCode::CONNECTION_ERROR.0),
        other => panic!("expected synthetic error, got {:?}", other),
    }
}
