//! Stream multiplexing internals: registry, per-stream state machines,
//! and fragment reassembly.
//!
//! Everything here is owned by the connection loop; no synchronization is
//! needed beyond the loop's own serialization.

pub(crate) mod entry;
pub(crate) mod fragment;
pub(crate) mod registry;

pub(crate) use entry::{Half, InteractionKind, OutEvent, PendingOut, RequestSeed, StreamEntry};
pub(crate) use fragment::Reassembly;
pub(crate) use registry::StreamRegistry;
