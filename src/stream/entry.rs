//! Per-stream state: two-half state machine and demand accounting.
//!
//! Every live stream is one [`StreamEntry`]. The local half tracks what
//! this side may still emit, the remote half what it may still receive;
//! the entry is reaped once both are closed. Demand arithmetic saturates
//! at `2^31 - 1` and can never underflow: outbound payload elements
//! submitted while granted demand is zero are queued here and drained by
//! incoming REQUEST_N.

use std::collections::VecDeque;

use crate::frame::Payload;
use crate::sink::BoxSink;
use crate::stream::fragment::Reassembly;
use crate::MAX_REQUEST_N;

/// Interaction model of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InteractionKind {
    /// Single request, single response.
    RequestResponse,
    /// Single request, stream of responses.
    RequestStream,
    /// Bidirectional payload channel.
    RequestChannel,
    /// Single request, no response. Only exists as an entry while the
    /// request is being reassembled from fragments.
    FireAndForget,
}

/// Which side of the interaction this entry plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamRole {
    /// This side initiated the stream.
    Requester,
    /// This side answers it.
    Responder,
}

/// State of one half of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Half {
    Open,
    Closed,
}

/// Initiation parameters retained while a fragmented request is still
/// being reassembled, before the responder callback has run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestSeed {
    pub kind: InteractionKind,
    pub initial_n: u32,
    pub complete: bool,
}

/// A locally-submitted outbound event waiting for demand.
#[derive(Debug)]
pub(crate) enum PendingOut {
    /// A payload element, optionally completing the local half.
    Next { payload: Payload, complete: bool },
    /// Completion without a further element.
    Complete,
}

/// An outbound event released by [`StreamEntry::drain_sendable`].
#[derive(Debug)]
pub(crate) enum OutEvent {
    Next { payload: Payload, complete: bool },
    Complete,
}

/// State for one live stream.
pub(crate) struct StreamEntry {
    pub kind: InteractionKind,
    pub role: StreamRole,
    pub local: Half,
    pub remote: Half,
    /// Elements this side may still emit (granted by the peer).
    pub outbound_demand: u32,
    /// Elements this side has granted the peer.
    pub inbound_demand: u32,
    /// Outbound elements waiting for demand.
    pub pending: VecDeque<PendingOut>,
    /// Event receiver; `None` while a fragmented initiation is still
    /// being reassembled.
    pub sink: Option<BoxSink>,
    /// In-progress fragment reassembly.
    pub reassembly: Option<Reassembly>,
    /// Initiation parameters awaiting reassembly completion.
    pub seed: Option<RequestSeed>,
    /// Registry epoch tag; stale handles are detected against it.
    pub epoch: u64,
}

impl StreamEntry {
    /// Entry for a locally-initiated stream, created as the request frame
    /// is sent.
    pub(crate) fn requester(
        kind: InteractionKind,
        sink: BoxSink,
        initial_n: u32,
        complete: bool,
    ) -> Self {
        let (local, inbound_demand) = match kind {
            InteractionKind::RequestResponse => (Half::Closed, 1),
            // Local half stays open solely to send REQUEST_N / CANCEL.
            InteractionKind::RequestStream => (Half::Open, initial_n),
            InteractionKind::RequestChannel => (
                if complete { Half::Closed } else { Half::Open },
                initial_n,
            ),
            InteractionKind::FireAndForget => (Half::Closed, 0),
        };
        Self {
            kind,
            role: StreamRole::Requester,
            local,
            remote: Half::Open,
            outbound_demand: 0,
            inbound_demand,
            pending: VecDeque::new(),
            sink: Some(sink),
            reassembly: None,
            seed: None,
            epoch: 0,
        }
    }

    /// Entry for a remotely-initiated stream, created as the request
    /// frame is dispatched to the responder.
    pub(crate) fn responder(
        kind: InteractionKind,
        sink: BoxSink,
        initial_n: u32,
        remote_complete: bool,
    ) -> Self {
        let remote = match kind {
            InteractionKind::RequestChannel if !remote_complete => Half::Open,
            _ => Half::Closed,
        };
        Self {
            kind,
            role: StreamRole::Responder,
            local: Half::Open,
            remote,
            outbound_demand: initial_n,
            inbound_demand: 0,
            pending: VecDeque::new(),
            sink: Some(sink),
            reassembly: None,
            seed: None,
            epoch: 0,
        }
    }

    /// Entry for a remotely-initiated stream whose request is still being
    /// reassembled; the responder callback runs once reassembly finishes.
    pub(crate) fn reassembling(seed: RequestSeed, reassembly: Reassembly) -> Self {
        Self {
            kind: seed.kind,
            role: StreamRole::Responder,
            local: Half::Open,
            remote: Half::Open,
            outbound_demand: seed.initial_n,
            inbound_demand: 0,
            pending: VecDeque::new(),
            sink: None,
            reassembly: Some(reassembly),
            seed: Some(seed),
            epoch: 0,
        }
    }

    /// Whether this side may emit payload elements at all.
    pub(crate) fn can_emit(&self) -> bool {
        match self.kind {
            InteractionKind::RequestResponse | InteractionKind::RequestStream => {
                self.role == StreamRole::Responder
            }
            InteractionKind::RequestChannel => true,
            InteractionKind::FireAndForget => false,
        }
    }

    /// Whether emissions are gated by granted demand. A request/response
    /// answer is exempt: its single element is implied by the request.
    pub(crate) fn demand_gated(&self) -> bool {
        self.kind != InteractionKind::RequestResponse
    }

    /// Add peer-granted demand, saturating at `2^31 - 1`.
    pub(crate) fn grant_outbound(&mut self, n: u32) {
        self.outbound_demand = self.outbound_demand.saturating_add(n).min(MAX_REQUEST_N);
    }

    /// Record demand granted to the peer, saturating at `2^31 - 1`.
    pub(crate) fn grant_inbound(&mut self, n: u32) {
        self.inbound_demand = self.inbound_demand.saturating_add(n).min(MAX_REQUEST_N);
    }

    /// Consume one unit of peer demand for an arriving element.
    /// Returns false on underflow (the peer sent beyond its grant).
    pub(crate) fn consume_inbound(&mut self) -> bool {
        if self.inbound_demand == 0 {
            return false;
        }
        self.inbound_demand -= 1;
        true
    }

    /// Queue an outbound element or completion.
    pub(crate) fn push_pending(&mut self, out: PendingOut) {
        self.pending.push_back(out);
    }

    /// Release queued outbound events permitted by current demand, in
    /// order. Next events consume demand; a completion is released as
    /// soon as it reaches the head. Closes the local half when a released
    /// event completes it.
    pub(crate) fn drain_sendable(&mut self) -> Vec<OutEvent> {
        let mut out = Vec::new();
        loop {
            let head_is_next = match self.pending.front() {
                Some(PendingOut::Next { .. }) => true,
                Some(PendingOut::Complete) => false,
                None => break,
            };
            if head_is_next {
                if self.demand_gated() {
                    if self.outbound_demand == 0 {
                        break;
                    }
                    self.outbound_demand -= 1;
                }
                if let Some(PendingOut::Next { payload, complete }) = self.pending.pop_front() {
                    if complete {
                        self.local = Half::Closed;
                    }
                    out.push(OutEvent::Next { payload, complete });
                }
            } else {
                self.pending.pop_front();
                self.local = Half::Closed;
                out.push(OutEvent::Complete);
            }
        }
        out
    }

    /// Whether both halves are closed and the entry can be reaped.
    pub(crate) fn is_terminated(&self) -> bool {
        self.local == Half::Closed && self.remote == Half::Closed && self.pending.is_empty()
    }
}
