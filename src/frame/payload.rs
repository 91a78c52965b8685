//! Payload type shared by payload-carrying frames.
//!
//! A payload is an optional metadata octet sequence plus a data octet
//! sequence; both are opaque to the protocol core. Uses `bytes::Bytes`
//! for zero-copy sharing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// Maximum value of a 24-bit length field.
pub(crate) const MAX_U24: u32 = 0x00FF_FFFF;

/// Write a 24-bit big-endian unsigned integer.
#[inline]
pub(crate) fn put_u24(buf: &mut BytesMut, value: u32) {
    debug_assert!(value <= MAX_U24);
    buf.put_u8((value >> 16) as u8);
    buf.put_u16((value & 0xFFFF) as u16);
}

/// Read a 24-bit big-endian unsigned integer.
#[inline]
pub(crate) fn get_u24(buf: &mut &[u8]) -> u32 {
    ((buf.get_u8() as u32) << 16) | buf.get_u16() as u32
}

/// An application payload: optional metadata plus data, both opaque.
///
/// Metadata presence is encoded by the METADATA header flag; zero-length
/// metadata with the flag set is distinct from absent metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Opaque metadata octets, if present.
    pub metadata: Option<Bytes>,
    /// Opaque data octets.
    pub data: Bytes,
}

impl Payload {
    /// Create a payload from metadata and data.
    pub fn new(metadata: Option<Bytes>, data: Bytes) -> Self {
        Self { metadata, data }
    }

    /// Create a data-only payload.
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self {
            metadata: None,
            data: data.into(),
        }
    }

    /// Create an empty payload (no metadata, no data).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether metadata is present (zero-length counts as present).
    #[inline]
    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    /// Total octet count across metadata and data.
    #[inline]
    pub fn len(&self) -> usize {
        self.metadata.as_ref().map_or(0, |m| m.len()) + self.data.len()
    }

    /// Whether the payload carries no octets at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode as a frame-body tail: when metadata is present, a 24-bit
    /// big-endian length prefix and the metadata octets come first; data
    /// occupies the remainder.
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        if let Some(metadata) = &self.metadata {
            put_u24(buf, metadata.len() as u32);
            buf.put_slice(metadata);
        }
        buf.put_slice(&self.data);
    }

    /// Decode a frame-body tail. `has_metadata` comes from the METADATA
    /// header flag.
    pub(crate) fn decode(buf: &mut &[u8], has_metadata: bool) -> Result<Payload, CodecError> {
        let metadata = if has_metadata {
            if buf.remaining() < 3 {
                return Err(CodecError::InsufficientBytes);
            }
            let len = get_u24(buf) as usize;
            if buf.remaining() < len {
                return Err(CodecError::InvalidMetadataLength);
            }
            Some(buf.copy_to_bytes(len))
        } else {
            None
        };
        let data = buf.copy_to_bytes(buf.remaining());
        Ok(Payload { metadata, data })
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Self {
        Payload::from_data(Bytes::from_static(data.as_bytes()))
    }
}
