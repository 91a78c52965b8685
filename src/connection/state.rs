//! Connection-level state: role, lifecycle phase, keepalive bookkeeping.

use std::time::{Duration, Instant};

/// Which end of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the connection and sends SETUP.
    Client,
    /// Awaits SETUP and gates acceptance.
    Server,
}

/// Lifecycle phase of a connection.
///
/// A server starts in `AwaitingSetup`; a client enters `Active` as soon
/// as SETUP is on the wire (rejection arrives as an ERROR on stream 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Server: no SETUP seen yet.
    AwaitingSetup,
    /// Server: SETUP accepted, initialization in flight; inbound frames
    /// are buffered for ordered replay.
    Establishing,
    /// Frames flow.
    Active,
    /// Close initiated, fan-out in progress.
    Closing,
    /// Done.
    Closed,
}

/// Mutable connection-level state owned by the connection loop.
pub(crate) struct ConnectionState {
    pub role: Role,
    pub phase: Phase,
    /// Interval between locally-emitted KEEPALIVE frames.
    pub keepalive_interval: Duration,
    /// Max tolerated silence from the peer before the connection dies.
    pub max_lifetime: Duration,
    pub last_inbound: Instant,
    pub last_outbound: Instant,
    pub close_reason: Option<String>,
}

impl ConnectionState {
    pub(crate) fn new(role: Role, keepalive_interval: Duration, max_lifetime: Duration) -> Self {
        let now = Instant::now();
        Self {
            role,
            phase: match role {
                Role::Client => Phase::Active,
                Role::Server => Phase::AwaitingSetup,
            },
            keepalive_interval,
            max_lifetime,
            last_inbound: now,
            last_outbound: now,
            close_reason: None,
        }
    }

    /// Record an inbound frame; resets the lifetime deadline.
    #[inline]
    pub(crate) fn stamp_inbound(&mut self) {
        self.last_inbound = Instant::now();
    }

    /// Record an outbound frame.
    #[inline]
    pub(crate) fn stamp_outbound(&mut self) {
        self.last_outbound = Instant::now();
    }

    /// Whether the peer has been silent past `max_lifetime`.
    pub(crate) fn lifetime_exceeded(&self) -> bool {
        self.last_inbound.elapsed() > self.max_lifetime
    }

    /// Server: SETUP accepted, initialization running.
    pub(crate) fn begin_establishing(&mut self, keepalive: Duration, max_lifetime: Duration) {
        debug_assert_eq!(self.phase, Phase::AwaitingSetup);
        self.keepalive_interval = keepalive;
        self.max_lifetime = max_lifetime;
        self.phase = Phase::Establishing;
    }

    /// Initialization resolved; frames flow.
    pub(crate) fn activate(&mut self) {
        debug_assert_eq!(self.phase, Phase::Establishing);
        self.phase = Phase::Active;
    }

    /// Start closing with a reason (first reason wins).
    pub(crate) fn begin_close(&mut self, reason: impl Into<String>) {
        if self.close_reason.is_none() {
            self.close_reason = Some(reason.into());
        }
        self.phase = Phase::Closing;
    }

    /// Terminal transition.
    pub(crate) fn closed(&mut self) {
        self.phase = Phase::Closed;
    }
}
