//! # rsocket-core
//!
//! Protocol core for RSocket v1.0: a symmetric, bidirectional,
//! multiplexed message protocol over a reliable byte-stream transport.
//! Both endpoints may simultaneously act as requester and responder;
//! four interaction models are supported (fire-and-forget,
//! request/response, request/stream, request/channel) plus
//! connection-level metadata push and keepalive.
//!
//! ## Architecture
//!
//! - **Frame codec** ([`frame`]): wire-exact binary encode/decode for
//!   every frame type. Pure functions, no I/O.
//! - **Connection loop** ([`connection`]): one task per connection owns
//!   the stream registry and all state machines; a dedicated writer task
//!   keeps wire order equal to submission order.
//! - **Facades** ([`Requester`], [`Responder`]): the application surface.
//!   Stream events flow through [`PayloadSink`] capability objects.
//!
//! The transport is anything `AsyncRead + AsyncWrite`; frames are carried
//! behind a 24-bit big-endian length prefix.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rsocket_core::{connect, ConnectionConfig, NoopResponder, Payload, SetupConfig};
//!
//! #[tokio::main]
//! async fn main() -> rsocket_core::Result<()> {
//!     let io = tokio::net::TcpStream::connect("127.0.0.1:7878").await?;
//!     let (requester, connection) = connect(
//!         io,
//!         SetupConfig::new().mime_types("utf8", "utf8"),
//!         Arc::new(NoopResponder),
//!         ConnectionConfig::default(),
//!     )
//!     .await?;
//!
//!     requester.fire_and_forget(Payload::from("Hello World"))?;
//!     connection.wait_for_shutdown().await
//! }
//! ```

pub mod connection;
pub mod error;
pub mod frame;
pub mod sink;

mod requester;
mod responder;
mod stream;
mod writer;

pub use connection::{
    accept, connect, ClientAcceptor, ConnectionConfig, ConnectionHandle, LateFrameHandler, Role,
    SetupConfig, SetupInfo, SetupRejection,
};
pub use error::{CodecError, ErrorCode, RSocketError, Result};
pub use frame::{Frame, FrameBody, Payload, Version};
pub use requester::{Requester, StreamHandle};
pub use responder::{NoopResponder, Responder};
pub use sink::{BoxSink, NoopSink, PayloadSink, StreamError};
pub use writer::WriterConfig;

/// Maximum demand a stream can accumulate (`2^31 - 1`); grants beyond it
/// saturate rather than wrap.
pub const MAX_REQUEST_N: u32 = 0x7FFF_FFFF;
