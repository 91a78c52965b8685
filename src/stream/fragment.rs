//! Fragment reassembly for payload-bearing frames.
//!
//! While the FOLLOWS flag is set, payload fragments are concatenated;
//! reassembly completes on the first fragment without FOLLOWS. The first
//! frame of a logical request carries the original frame type; continuation
//! fragments arrive as PAYLOAD frames. Reassembly is capped by
//! configuration; a stream that exceeds the cap is canceled.

use bytes::BytesMut;

use crate::frame::Payload;

/// Reassembly exceeded the configured byte cap.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ReassemblyOverflow;

/// Accumulator for one logical frame split across fragments.
pub(crate) struct Reassembly {
    /// NEXT flag of the first fragment (meaningful for PAYLOAD frames).
    next: bool,
    metadata: Option<BytesMut>,
    data: BytesMut,
    limit: usize,
}

impl Reassembly {
    /// Begin reassembly with the first fragment.
    pub(crate) fn new(first: Payload, next: bool, limit: usize) -> Result<Self, ReassemblyOverflow> {
        let mut this = Self {
            next,
            metadata: None,
            data: BytesMut::new(),
            limit,
        };
        this.append(first)?;
        Ok(this)
    }

    /// Append a continuation fragment.
    pub(crate) fn append(&mut self, fragment: Payload) -> Result<(), ReassemblyOverflow> {
        if let Some(metadata) = fragment.metadata {
            self.metadata
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(&metadata);
        }
        self.data.extend_from_slice(&fragment.data);
        if self.size() > self.limit {
            return Err(ReassemblyOverflow);
        }
        Ok(())
    }

    /// Complete reassembly with the final fragment and yield the logical
    /// payload plus the NEXT flag of the first fragment.
    pub(crate) fn finish(mut self, last: Payload) -> Result<(Payload, bool), ReassemblyOverflow> {
        self.append(last)?;
        let payload = Payload {
            metadata: self.metadata.map(BytesMut::freeze),
            data: self.data.freeze(),
        };
        Ok((payload, self.next))
    }

    fn size(&self) -> usize {
        self.metadata.as_ref().map_or(0, |m| m.len()) + self.data.len()
    }
}
