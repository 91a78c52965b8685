//! Stream registry - ID allocation and the per-stream state table.
//!
//! The registry is owned exclusively by the connection loop. It allocates
//! stream IDs with the role's parity (client odd, server even), indexes
//! live entries by ID for O(1) routing, and reaps entries once both
//! halves of a stream have closed.

use std::collections::HashMap;

use crate::connection::state::Role;
use crate::frame::MAX_STREAM_ID;
use crate::stream::entry::StreamEntry;

/// Monotonic stream-ID allocator for one role.
///
/// Client-minted IDs are odd starting at 1, server-minted even starting
/// at 2, stepping by 2. IDs are never reused within a connection; on
/// exhaustion of the 31-bit space the connection must be terminated.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    /// Next candidate ID. Kept wider than 31 bits so stepping past the
    /// ceiling is representable.
    next: u64,
}

impl IdAllocator {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            next: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
        }
    }

    /// Mint the next ID, skipping any currently live in `entries`.
    ///
    /// Returns `None` when the 31-bit space is exhausted.
    pub(crate) fn allocate(&mut self, entries: &HashMap<u32, StreamEntry>) -> Option<u32> {
        loop {
            if self.next > MAX_STREAM_ID as u64 {
                return None;
            }
            let id = self.next as u32;
            self.next += 2;
            if !entries.contains_key(&id) {
                return Some(id);
            }
        }
    }
}

/// Table of live streams for one connection.
pub(crate) struct StreamRegistry {
    role: Role,
    entries: HashMap<u32, StreamEntry>,
    allocator: IdAllocator,
    next_epoch: u64,
}

impl StreamRegistry {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            role,
            entries: HashMap::new(),
            allocator: IdAllocator::new(role),
            next_epoch: 1,
        }
    }

    /// Mint a locally-initiated stream ID.
    pub(crate) fn allocate(&mut self) -> Option<u32> {
        self.allocator.allocate(&self.entries)
    }

    /// Insert an entry under `id`, stamping it with a fresh epoch.
    ///
    /// Returns the epoch. At most one entry may exist per ID; inserting
    /// over a live entry is a caller bug.
    pub(crate) fn insert(&mut self, id: u32, mut entry: StreamEntry) -> u64 {
        debug_assert!(!self.entries.contains_key(&id));
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        entry.epoch = epoch;
        self.entries.insert(id, entry);
        epoch
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut StreamEntry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Remove and return the entry for `id`.
    pub(crate) fn remove(&mut self, id: u32) -> Option<StreamEntry> {
        self.entries.remove(&id)
    }

    /// Number of live streams.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every entry, for connection-close fan-out.
    pub(crate) fn drain_all(&mut self) -> Vec<StreamEntry> {
        self.entries.drain().map(|(_, e)| e).collect()
    }

    /// Parity bit of peer-minted stream IDs (1 = odd).
    pub(crate) fn peer_parity(&self) -> u32 {
        match self.role {
            // The peer of a server is a client: odd IDs.
            Role::Server => 1,
            Role::Client => 0,
        }
    }

    /// Parity bit of locally-minted stream IDs (1 = odd).
    #[cfg(test)]
    pub(crate) fn local_parity(&self) -> u32 {
        1 - self.peer_parity()
    }
}
