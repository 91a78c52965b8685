//! Frame types and the binary frame codec.
//!
//! This module implements the wire format:
//! - 6-byte header encoding/decoding ([`header`])
//! - per-type frame bodies with bit-exact layouts ([`Frame`], [`FrameBody`])
//! - frame buffer for accumulating length-prefixed reads ([`FrameBuffer`])
//!
//! Encode and decode are pure functions over octet buffers; the codec never
//! touches the transport. For every valid frame `f`,
//! `Frame::decode(&f.encode()?)` yields `f` back.

pub(crate) mod buffer;
mod header;
mod payload;

pub use buffer::FrameBuffer;
pub use header::{flags, FrameType, RawHeader, StreamIdRule, FLAGS_MASK, HEADER_SIZE, MAX_STREAM_ID};
pub use payload::Payload;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CodecError, ErrorCode};

/// Protocol version carried by SETUP and RESUME frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

impl Version {
    /// The protocol version this crate implements.
    pub const CURRENT: Version = Version { major: 1, minor: 0 };
}

impl Default for Version {
    fn default() -> Self {
        Version::CURRENT
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A complete protocol frame: stream ID plus typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream ID (0 = connection stream).
    pub stream_id: u32,
    /// Typed frame body.
    pub body: FrameBody,
}

/// Frame bodies, one variant per frame type.
///
/// Flag-derived fields (`follows`, `complete`, `next`, `respond`) are
/// plain booleans here; the codec maps them to header flag bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// SETUP: first frame sent by the client on stream 0.
    Setup {
        /// Protocol version.
        version: Version,
        /// Time between KEEPALIVE frames, milliseconds, > 0.
        keepalive_ms: u32,
        /// Max lifetime without an inbound frame, milliseconds.
        max_lifetime_ms: u32,
        /// Resume identification token, present iff the RESUME flag is set.
        resume_token: Option<Bytes>,
        /// Metadata encoding MIME type (US-ASCII, at most 255 octets).
        metadata_mime: String,
        /// Data encoding MIME type (US-ASCII, at most 255 octets).
        data_mime: String,
        /// Whether the client honors LEASE frames.
        honors_lease: bool,
        /// Setup payload.
        payload: Payload,
    },
    /// LEASE: grant of requests on stream 0.
    Lease {
        /// Validity time of the lease, milliseconds.
        ttl_ms: u32,
        /// Number of requests granted.
        number_of_requests: u32,
        /// Optional lease metadata (remainder of the body, no length prefix).
        metadata: Option<Bytes>,
    },
    /// KEEPALIVE: connection liveness probe on stream 0.
    Keepalive {
        /// Whether the receiver must answer with a KEEPALIVE.
        respond: bool,
        /// Resume position of the sender.
        last_received_position: u64,
        /// Opaque probe data, echoed back in the response.
        data: Bytes,
    },
    /// REQUEST_RESPONSE: single request, single response.
    RequestResponse {
        /// More fragments follow.
        follows: bool,
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_FNF: fire-and-forget request.
    RequestFnf {
        /// More fragments follow.
        follows: bool,
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_STREAM: request a stream of payloads.
    RequestStream {
        /// Initial demand granted to the responder.
        initial_request_n: u32,
        /// More fragments follow.
        follows: bool,
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_CHANNEL: request a bidirectional payload channel.
    RequestChannel {
        /// Initial demand granted to the responder.
        initial_request_n: u32,
        /// More fragments follow.
        follows: bool,
        /// The requester will send nothing beyond the initial payload.
        complete: bool,
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_N: grant additional demand on a stream.
    RequestN {
        /// Additional payload count granted, > 0.
        n: u32,
    },
    /// CANCEL: cancel an outstanding request.
    Cancel,
    /// PAYLOAD: payload on an established stream.
    Payload {
        /// More fragments follow.
        follows: bool,
        /// Stream completion.
        complete: bool,
        /// A payload element is present.
        next: bool,
        /// The payload.
        payload: Payload,
    },
    /// ERROR: connection error (stream 0) or stream error.
    Error {
        /// Error code.
        code: ErrorCode,
        /// UTF-8 error data.
        message: String,
    },
    /// METADATA_PUSH: push metadata on stream 0.
    MetadataPush {
        /// Metadata octets (remainder of the body, no length prefix).
        metadata: Bytes,
    },
    /// RESUME: client attempt to resume an earlier connection.
    Resume {
        /// Protocol version.
        version: Version,
        /// Resume identification token.
        token: Bytes,
        /// Last server position received by the client.
        last_received_server_position: u64,
        /// First client position still available for retransmission.
        first_available_client_position: u64,
    },
    /// RESUME_OK: server acceptance of a RESUME.
    ResumeOk {
        /// Last client position received by the server.
        last_received_client_position: u64,
    },
    /// EXT: protocol extension frame.
    Ext {
        /// Extended type identifier.
        extended_type: u32,
        /// Extension body.
        data: Bytes,
    },
}

impl FrameBody {
    /// The frame type of this body.
    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameBody::Setup { .. } => FrameType::Setup,
            FrameBody::Lease { .. } => FrameType::Lease,
            FrameBody::Keepalive { .. } => FrameType::Keepalive,
            FrameBody::RequestResponse { .. } => FrameType::RequestResponse,
            FrameBody::RequestFnf { .. } => FrameType::RequestFnf,
            FrameBody::RequestStream { .. } => FrameType::RequestStream,
            FrameBody::RequestChannel { .. } => FrameType::RequestChannel,
            FrameBody::RequestN { .. } => FrameType::RequestN,
            FrameBody::Cancel => FrameType::Cancel,
            FrameBody::Payload { .. } => FrameType::Payload,
            FrameBody::Error { .. } => FrameType::Error,
            FrameBody::MetadataPush { .. } => FrameType::MetadataPush,
            FrameBody::Resume { .. } => FrameType::Resume,
            FrameBody::ResumeOk { .. } => FrameType::ResumeOk,
            FrameBody::Ext { .. } => FrameType::Ext,
        }
    }

    /// Header flags derived from this body's fields.
    fn derived_flags(&self) -> u16 {
        match self {
            FrameBody::Setup {
                resume_token,
                honors_lease,
                payload,
                ..
            } => {
                let mut f = 0;
                if payload.has_metadata() {
                    f |= flags::METADATA;
                }
                if resume_token.is_some() {
                    f |= flags::RESUME;
                }
                if *honors_lease {
                    f |= flags::LEASE;
                }
                f
            }
            FrameBody::Lease { metadata, .. } => {
                if metadata.is_some() {
                    flags::METADATA
                } else {
                    0
                }
            }
            FrameBody::Keepalive { respond, .. } => {
                if *respond {
                    flags::RESPOND
                } else {
                    0
                }
            }
            FrameBody::RequestResponse { follows, payload }
            | FrameBody::RequestFnf { follows, payload } => {
                let mut f = 0;
                if payload.has_metadata() {
                    f |= flags::METADATA;
                }
                if *follows {
                    f |= flags::FOLLOWS;
                }
                f
            }
            FrameBody::RequestStream {
                follows, payload, ..
            } => {
                let mut f = 0;
                if payload.has_metadata() {
                    f |= flags::METADATA;
                }
                if *follows {
                    f |= flags::FOLLOWS;
                }
                f
            }
            FrameBody::RequestChannel {
                follows,
                complete,
                payload,
                ..
            } => {
                let mut f = 0;
                if payload.has_metadata() {
                    f |= flags::METADATA;
                }
                if *follows {
                    f |= flags::FOLLOWS;
                }
                if *complete {
                    f |= flags::COMPLETE;
                }
                f
            }
            FrameBody::Payload {
                follows,
                complete,
                next,
                payload,
            } => {
                let mut f = 0;
                if payload.has_metadata() {
                    f |= flags::METADATA;
                }
                if *follows {
                    f |= flags::FOLLOWS;
                }
                if *complete {
                    f |= flags::COMPLETE;
                }
                if *next {
                    f |= flags::NEXT;
                }
                f
            }
            FrameBody::MetadataPush { .. } => flags::METADATA,
            FrameBody::RequestN { .. }
            | FrameBody::Cancel
            | FrameBody::Error { .. }
            | FrameBody::Resume { .. }
            | FrameBody::ResumeOk { .. }
            | FrameBody::Ext { .. } => 0,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            FrameBody::Setup {
                version,
                keepalive_ms,
                max_lifetime_ms,
                resume_token,
                metadata_mime,
                data_mime,
                honors_lease: _,
                payload,
            } => {
                buf.put_u16(version.major);
                buf.put_u16(version.minor);
                buf.put_u32(*keepalive_ms);
                buf.put_u32(*max_lifetime_ms);
                if let Some(token) = resume_token {
                    buf.put_u16(token.len() as u16);
                    buf.put_slice(token);
                }
                buf.put_u8(metadata_mime.len() as u8);
                buf.put_slice(metadata_mime.as_bytes());
                buf.put_u8(data_mime.len() as u8);
                buf.put_slice(data_mime.as_bytes());
                payload.encode_into(buf);
            }
            FrameBody::Lease {
                ttl_ms,
                number_of_requests,
                metadata,
            } => {
                buf.put_u32(*ttl_ms);
                buf.put_u32(*number_of_requests);
                if let Some(metadata) = metadata {
                    buf.put_slice(metadata);
                }
            }
            FrameBody::Keepalive {
                respond: _,
                last_received_position,
                data,
            } => {
                buf.put_u64(*last_received_position);
                buf.put_slice(data);
            }
            FrameBody::RequestResponse { payload, .. }
            | FrameBody::RequestFnf { payload, .. } => payload.encode_into(buf),
            FrameBody::RequestStream {
                initial_request_n,
                payload,
                ..
            }
            | FrameBody::RequestChannel {
                initial_request_n,
                payload,
                ..
            } => {
                buf.put_u32(*initial_request_n);
                payload.encode_into(buf);
            }
            FrameBody::RequestN { n } => buf.put_u32(*n),
            FrameBody::Cancel => {}
            FrameBody::Payload { payload, .. } => payload.encode_into(buf),
            FrameBody::Error { code, message } => {
                buf.put_u32(code.0);
                buf.put_slice(message.as_bytes());
            }
            FrameBody::MetadataPush { metadata } => buf.put_slice(metadata),
            FrameBody::Resume {
                version,
                token,
                last_received_server_position,
                first_available_client_position,
            } => {
                buf.put_u16(version.major);
                buf.put_u16(version.minor);
                buf.put_u16(token.len() as u16);
                buf.put_slice(token);
                buf.put_u64(*last_received_server_position);
                buf.put_u64(*first_available_client_position);
            }
            FrameBody::ResumeOk {
                last_received_client_position,
            } => buf.put_u64(*last_received_client_position),
            FrameBody::Ext {
                extended_type,
                data,
            } => {
                buf.put_u32(*extended_type);
                buf.put_slice(data);
            }
        }
    }

    fn decode_body(
        frame_type: FrameType,
        frame_flags: u16,
        buf: &mut &[u8],
    ) -> Result<FrameBody, CodecError> {
        let has_metadata = flags::has_flag(frame_flags, flags::METADATA);
        match frame_type {
            FrameType::Setup => {
                need(buf, 12)?;
                let version = Version {
                    major: buf.get_u16(),
                    minor: buf.get_u16(),
                };
                let keepalive_ms = buf.get_u32();
                let max_lifetime_ms = buf.get_u32();
                let resume_token = if flags::has_flag(frame_flags, flags::RESUME) {
                    need(buf, 2)?;
                    let len = buf.get_u16() as usize;
                    need(buf, len)?;
                    Some(buf.copy_to_bytes(len))
                } else {
                    None
                };
                let metadata_mime = decode_mime(buf)?;
                let data_mime = decode_mime(buf)?;
                let payload = Payload::decode(buf, has_metadata)?;
                Ok(FrameBody::Setup {
                    version,
                    keepalive_ms,
                    max_lifetime_ms,
                    resume_token,
                    metadata_mime,
                    data_mime,
                    honors_lease: flags::has_flag(frame_flags, flags::LEASE),
                    payload,
                })
            }
            FrameType::Lease => {
                need(buf, 8)?;
                let ttl_ms = buf.get_u32();
                let number_of_requests = buf.get_u32();
                let metadata = if has_metadata {
                    Some(buf.copy_to_bytes(buf.remaining()))
                } else {
                    None
                };
                Ok(FrameBody::Lease {
                    ttl_ms,
                    number_of_requests,
                    metadata,
                })
            }
            FrameType::Keepalive => {
                need(buf, 8)?;
                Ok(FrameBody::Keepalive {
                    respond: flags::has_flag(frame_flags, flags::RESPOND),
                    last_received_position: buf.get_u64(),
                    data: buf.copy_to_bytes(buf.remaining()),
                })
            }
            FrameType::RequestResponse => Ok(FrameBody::RequestResponse {
                follows: flags::has_flag(frame_flags, flags::FOLLOWS),
                payload: Payload::decode(buf, has_metadata)?,
            }),
            FrameType::RequestFnf => Ok(FrameBody::RequestFnf {
                follows: flags::has_flag(frame_flags, flags::FOLLOWS),
                payload: Payload::decode(buf, has_metadata)?,
            }),
            FrameType::RequestStream => {
                need(buf, 4)?;
                Ok(FrameBody::RequestStream {
                    initial_request_n: buf.get_u32(),
                    follows: flags::has_flag(frame_flags, flags::FOLLOWS),
                    payload: Payload::decode(buf, has_metadata)?,
                })
            }
            FrameType::RequestChannel => {
                need(buf, 4)?;
                Ok(FrameBody::RequestChannel {
                    initial_request_n: buf.get_u32(),
                    follows: flags::has_flag(frame_flags, flags::FOLLOWS),
                    complete: flags::has_flag(frame_flags, flags::COMPLETE),
                    payload: Payload::decode(buf, has_metadata)?,
                })
            }
            FrameType::RequestN => {
                need(buf, 4)?;
                Ok(FrameBody::RequestN { n: buf.get_u32() })
            }
            FrameType::Cancel => Ok(FrameBody::Cancel),
            FrameType::Payload => Ok(FrameBody::Payload {
                follows: flags::has_flag(frame_flags, flags::FOLLOWS),
                complete: flags::has_flag(frame_flags, flags::COMPLETE),
                next: flags::has_flag(frame_flags, flags::NEXT),
                payload: Payload::decode(buf, has_metadata)?,
            }),
            FrameType::Error => {
                need(buf, 4)?;
                let code = ErrorCode(buf.get_u32());
                let message = String::from_utf8_lossy(*buf).into_owned();
                let remaining = buf.len();
                buf.advance(remaining);
                Ok(FrameBody::Error { code, message })
            }
            FrameType::MetadataPush => Ok(FrameBody::MetadataPush {
                metadata: buf.copy_to_bytes(buf.remaining()),
            }),
            FrameType::Resume => {
                need(buf, 6)?;
                let version = Version {
                    major: buf.get_u16(),
                    minor: buf.get_u16(),
                };
                let len = buf.get_u16() as usize;
                need(buf, len + 16)?;
                let token = buf.copy_to_bytes(len);
                Ok(FrameBody::Resume {
                    version,
                    token,
                    last_received_server_position: buf.get_u64(),
                    first_available_client_position: buf.get_u64(),
                })
            }
            FrameType::ResumeOk => {
                need(buf, 8)?;
                Ok(FrameBody::ResumeOk {
                    last_received_client_position: buf.get_u64(),
                })
            }
            FrameType::Ext => {
                need(buf, 4)?;
                Ok(FrameBody::Ext {
                    extended_type: buf.get_u32(),
                    data: buf.copy_to_bytes(buf.remaining()),
                })
            }
            FrameType::Reserved => Err(CodecError::UnsupportedFrameType(0x00)),
        }
    }
}

impl Frame {
    /// Create a frame from a stream ID and body.
    pub fn new(stream_id: u32, body: FrameBody) -> Self {
        Self { stream_id, body }
    }

    /// The frame type of this frame.
    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.body.frame_type()
    }

    /// An ERROR frame.
    pub fn error(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::new(
            stream_id,
            FrameBody::Error {
                code,
                message: message.into(),
            },
        )
    }

    /// A PAYLOAD frame carrying one element, optionally completing.
    pub fn payload_next(stream_id: u32, payload: Payload, complete: bool) -> Self {
        Frame::new(
            stream_id,
            FrameBody::Payload {
                follows: false,
                complete,
                next: true,
                payload,
            },
        )
    }

    /// A PAYLOAD frame signalling completion without an element.
    pub fn payload_complete(stream_id: u32) -> Self {
        Frame::new(
            stream_id,
            FrameBody::Payload {
                follows: false,
                complete: true,
                next: false,
                payload: Payload::empty(),
            },
        )
    }

    /// A CANCEL frame.
    pub fn cancel(stream_id: u32) -> Self {
        Frame::new(stream_id, FrameBody::Cancel)
    }

    /// A REQUEST_N frame.
    pub fn request_n(stream_id: u32, n: u32) -> Self {
        Frame::new(stream_id, FrameBody::RequestN { n })
    }

    /// A KEEPALIVE frame on the connection stream.
    pub fn keepalive(respond: bool, last_received_position: u64, data: Bytes) -> Self {
        Frame::new(
            0,
            FrameBody::Keepalive {
                respond,
                last_received_position,
                data,
            },
        )
    }

    /// A METADATA_PUSH frame on the connection stream.
    pub fn metadata_push(metadata: Bytes) -> Self {
        Frame::new(0, FrameBody::MetadataPush { metadata })
    }

    /// Encode this frame to octets.
    ///
    /// Fails with [`CodecError::InvalidStreamId`] before any bytes are
    /// produced when the stream ID is illegal for the frame type.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let frame_type = self.frame_type();
        check_stream_id(frame_type, self.stream_id)?;
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 32);
        RawHeader::new(self.stream_id, frame_type, self.body.derived_flags()).encode_into(&mut buf);
        self.body.encode_body(&mut buf);
        Ok(buf.freeze())
    }

    /// Decode a whole frame from octets.
    ///
    /// Returns `Ok(None)` when the frame type is unknown and the header
    /// carries the IGNORE flag (the frame is discarded silently); unknown
    /// without IGNORE is [`CodecError::UnsupportedFrameType`].
    pub fn decode(buf: &[u8]) -> Result<Option<Frame>, CodecError> {
        let header = RawHeader::decode(buf)?;
        let frame_type = match FrameType::from_code(header.type_code) {
            Some(FrameType::Reserved) | None => {
                return if header.has(flags::IGNORE) {
                    Ok(None)
                } else {
                    Err(CodecError::UnsupportedFrameType(header.type_code))
                };
            }
            Some(ty) => ty,
        };
        check_stream_id(frame_type, header.stream_id)?;
        // Flags the type does not define are ignored, not rejected.
        let frame_flags = header.flags & frame_type.allowed_flags();
        let mut body = &buf[HEADER_SIZE..];
        let body = FrameBody::decode_body(frame_type, frame_flags, &mut body)?;
        Ok(Some(Frame {
            stream_id: header.stream_id,
            body,
        }))
    }
}

fn check_stream_id(frame_type: FrameType, stream_id: u32) -> Result<(), CodecError> {
    let legal = match frame_type.stream_id_rule() {
        StreamIdRule::ConnectionOnly => stream_id == 0,
        StreamIdRule::StreamOnly => stream_id != 0,
        StreamIdRule::Any => true,
    };
    if !legal {
        return Err(CodecError::InvalidStreamId {
            stream_id,
            frame_type: frame_type.name(),
        });
    }
    Ok(())
}

fn need(buf: &&[u8], n: usize) -> Result<(), CodecError> {
    if buf.len() < n {
        return Err(CodecError::InsufficientBytes);
    }
    Ok(())
}

fn decode_mime(buf: &mut &[u8]) -> Result<String, CodecError> {
    need(buf, 1)?;
    let len = buf.get_u8() as usize;
    need(buf, len)?;
    let raw = &buf[..len];
    if !raw.is_ascii() {
        return Err(CodecError::InvalidHeader("non-ascii mime type".to_string()));
    }
    let mime = String::from_utf8_lossy(raw).into_owned();
    buf.advance(len);
    Ok(mime)
}
