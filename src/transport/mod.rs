//! Zero-copy channel between a client and its server.
//!
//! Bulk data never goes through two-sided messages: the client publishes a
//! span of its ring through the server's mailbox, and the server pulls the
//! bytes with a one-sided read. Two-sided control messages only carry region
//! handles, acknowledgments and the final `Done`.

pub mod client;
pub mod connection;
pub mod fabric;
pub mod handshake;
pub mod region;
pub mod server;

pub use client::{ChannelStats, ClientChannel};
pub use connection::{Connection, RecvState, SendState};
pub use fabric::{
    Completion, CompletionKind, CompletionStatus, ControlMessage, Endpoint, EndpointAddress,
    Fabric, PollMode,
};
pub use handshake::{HandshakeDescriptor, Signal, DESCRIPTOR_SIZE};
pub use region::{Access, MemoryRegion, RegionHandle};
pub use server::{ClientLink, ReadOutcome};

/// Contiguous byte range `[start, end)` of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "span [{}, {}) is reversed", start, end);
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `next` starts where this span ends.
    pub fn is_followed_by(&self, next: &Span) -> bool {
        self.end == next.start
    }
}
