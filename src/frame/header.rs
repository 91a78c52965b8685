//! Frame header encoding and decoding.
//!
//! Implements the 6-byte frame header:
//! ```text
//! ┌──────────────────────┬────────────┬─────────────┐
//! │ Stream ID            │ Frame Type │ Flags       │
//! │ 4 bytes (top bit 0)  │ 6 bits     │ 10 bits     │
//! │ uint32 BE            │            │             │
//! └──────────────────────┴────────────┴─────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The header is followed by the
//! frame-type-specific body.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;

/// Header size in bytes (fixed, exactly 6).
pub const HEADER_SIZE: usize = 6;

/// Maximum legal stream ID (31-bit space).
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Mask of the 10-bit flags field.
pub const FLAGS_MASK: u16 = 0x03FF;

/// Flag constants for the 10-bit flags field.
///
/// Several bits are reused across frame types; each constant documents the
/// types it applies to.
pub mod flags {
    /// Ignore frame if not understood (all types).
    pub const IGNORE: u16 = 0b10_0000_0000;
    /// Metadata present (payload-carrying types, LEASE, METADATA_PUSH).
    pub const METADATA: u16 = 0b01_0000_0000;
    /// Resume token present (SETUP).
    pub const RESUME: u16 = 0b00_1000_0000;
    /// Respond with a KEEPALIVE (KEEPALIVE).
    pub const RESPOND: u16 = 0b00_1000_0000;
    /// More fragments follow this frame (request and PAYLOAD types).
    pub const FOLLOWS: u16 = 0b00_1000_0000;
    /// Lease will be honored (SETUP).
    pub const LEASE: u16 = 0b00_0100_0000;
    /// Stream completion (PAYLOAD, REQUEST_CHANNEL).
    pub const COMPLETE: u16 = 0b00_0100_0000;
    /// Payload element present (PAYLOAD).
    pub const NEXT: u16 = 0b00_0010_0000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u16, flag: u16) -> bool {
        flags & flag != 0
    }
}

/// Frame type codes (6-bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Reserved, never sent.
    Reserved = 0x00,
    /// Connection setup (first client frame).
    Setup = 0x01,
    /// Lease grant.
    Lease = 0x02,
    /// Connection liveness probe.
    Keepalive = 0x03,
    /// Request single response.
    RequestResponse = 0x04,
    /// Request fire-and-forget.
    RequestFnf = 0x05,
    /// Request a stream of payloads.
    RequestStream = 0x06,
    /// Request a bidirectional channel.
    RequestChannel = 0x07,
    /// Grant additional demand on a stream.
    RequestN = 0x08,
    /// Cancel an outstanding request.
    Cancel = 0x09,
    /// Payload on a stream.
    Payload = 0x0A,
    /// Connection or stream error.
    Error = 0x0B,
    /// Push metadata on the connection.
    MetadataPush = 0x0C,
    /// Resume a previous connection.
    Resume = 0x0D,
    /// Resume accepted.
    ResumeOk = 0x0E,
    /// Protocol extension.
    Ext = 0x3F,
}

/// Which stream IDs a frame type may legally carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamIdRule {
    /// Only the connection stream (ID 0).
    ConnectionOnly,
    /// Only a data stream (ID != 0).
    StreamOnly,
    /// Either.
    Any,
}

impl FrameType {
    /// Resolve a 6-bit type code.
    pub fn from_code(code: u8) -> Option<FrameType> {
        match code {
            0x00 => Some(FrameType::Reserved),
            0x01 => Some(FrameType::Setup),
            0x02 => Some(FrameType::Lease),
            0x03 => Some(FrameType::Keepalive),
            0x04 => Some(FrameType::RequestResponse),
            0x05 => Some(FrameType::RequestFnf),
            0x06 => Some(FrameType::RequestStream),
            0x07 => Some(FrameType::RequestChannel),
            0x08 => Some(FrameType::RequestN),
            0x09 => Some(FrameType::Cancel),
            0x0A => Some(FrameType::Payload),
            0x0B => Some(FrameType::Error),
            0x0C => Some(FrameType::MetadataPush),
            0x0D => Some(FrameType::Resume),
            0x0E => Some(FrameType::ResumeOk),
            0x3F => Some(FrameType::Ext),
            _ => None,
        }
    }

    /// The wire code of this type.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Flags this frame type defines. Undefined flags are ignored on
    /// decode, never rejected.
    pub fn allowed_flags(self) -> u16 {
        use flags::*;
        match self {
            FrameType::Reserved => IGNORE,
            FrameType::Setup => IGNORE | METADATA | RESUME | LEASE,
            FrameType::Lease => IGNORE | METADATA,
            FrameType::Keepalive => IGNORE | RESPOND,
            FrameType::RequestResponse | FrameType::RequestFnf => IGNORE | METADATA | FOLLOWS,
            FrameType::RequestStream => IGNORE | METADATA | FOLLOWS,
            FrameType::RequestChannel => IGNORE | METADATA | FOLLOWS | COMPLETE,
            FrameType::RequestN => IGNORE,
            FrameType::Cancel => IGNORE,
            FrameType::Payload => IGNORE | METADATA | FOLLOWS | COMPLETE | NEXT,
            FrameType::Error => IGNORE,
            FrameType::MetadataPush => IGNORE | METADATA,
            FrameType::Resume => IGNORE,
            FrameType::ResumeOk => IGNORE,
            FrameType::Ext => IGNORE | METADATA,
        }
    }

    /// The stream-ID rule for this frame type.
    pub fn stream_id_rule(self) -> StreamIdRule {
        match self {
            FrameType::Setup
            | FrameType::Lease
            | FrameType::Keepalive
            | FrameType::MetadataPush
            | FrameType::Resume
            | FrameType::ResumeOk => StreamIdRule::ConnectionOnly,
            FrameType::RequestResponse
            | FrameType::RequestFnf
            | FrameType::RequestStream
            | FrameType::RequestChannel
            | FrameType::RequestN
            | FrameType::Cancel
            | FrameType::Payload => StreamIdRule::StreamOnly,
            FrameType::Reserved | FrameType::Error | FrameType::Ext => StreamIdRule::Any,
        }
    }

    /// Name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            FrameType::Reserved => "RESERVED",
            FrameType::Setup => "SETUP",
            FrameType::Lease => "LEASE",
            FrameType::Keepalive => "KEEPALIVE",
            FrameType::RequestResponse => "REQUEST_RESPONSE",
            FrameType::RequestFnf => "REQUEST_FNF",
            FrameType::RequestStream => "REQUEST_STREAM",
            FrameType::RequestChannel => "REQUEST_CHANNEL",
            FrameType::RequestN => "REQUEST_N",
            FrameType::Cancel => "CANCEL",
            FrameType::Payload => "PAYLOAD",
            FrameType::Error => "ERROR",
            FrameType::MetadataPush => "METADATA_PUSH",
            FrameType::Resume => "RESUME",
            FrameType::ResumeOk => "RESUME_OK",
            FrameType::Ext => "EXT",
        }
    }

    /// Whether this type opens a new stream when received by a responder.
    #[inline]
    pub fn is_request_initiation(self) -> bool {
        matches!(
            self,
            FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
        )
    }
}

/// Decoded frame header in raw form: the type is still a code so that
/// unknown types can be inspected for the IGNORE flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    /// Stream ID (31-bit, 0 = connection stream).
    pub stream_id: u32,
    /// 6-bit frame type code.
    pub type_code: u8,
    /// 10-bit flags field.
    pub flags: u16,
}

impl RawHeader {
    /// Create a new header for a known frame type.
    pub fn new(stream_id: u32, frame_type: FrameType, flags: u16) -> Self {
        Self {
            stream_id,
            type_code: frame_type.code(),
            flags: flags & FLAGS_MASK,
        }
    }

    /// Encode the header into a buffer (Big Endian).
    pub fn encode_into(&self, buf: &mut BytesMut) {
        debug_assert!(self.stream_id <= MAX_STREAM_ID);
        buf.put_u32(self.stream_id);
        buf.put_u16(((self.type_code as u16) << 10) | (self.flags & FLAGS_MASK));
    }

    /// Decode a header from bytes (Big Endian).
    pub fn decode(buf: &[u8]) -> Result<RawHeader, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::InsufficientBytes);
        }
        let mut b = buf;
        let stream_id = b.get_u32();
        if stream_id > MAX_STREAM_ID {
            return Err(CodecError::InvalidHeader(
                "reserved stream id bit set".to_string(),
            ));
        }
        let type_and_flags = b.get_u16();
        Ok(RawHeader {
            stream_id,
            type_code: (type_and_flags >> 10) as u8,
            flags: type_and_flags & FLAGS_MASK,
        })
    }

    /// Check if a flag is set on this header.
    #[inline]
    pub fn has(&self, flag: u16) -> bool {
        flags::has_flag(self.flags, flag)
    }
}
