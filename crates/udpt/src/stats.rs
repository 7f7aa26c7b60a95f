/// Receiver statistics, shared between the accept loop and whoever holds the
/// handle. All fields are atomic for lock-free reads.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct ReceiverStats {
    /// Datagrams read from the socket.
    pub datagrams: AtomicU64,
    /// Datagrams that did not parse as a v1 packet.
    pub malformed: AtomicU64,
    /// Datagrams that failed authentication.
    pub integrity_drops: AtomicU64,
    pub sessions_opened: AtomicU64,
    /// Packets refused by session limits or header disagreement.
    pub sessions_rejected: AtomicU64,
    /// Partial sessions removed by the inactivity sweep.
    pub sessions_swept: AtomicU64,
    pub duplicate_chunks: AtomicU64,
    pub conflicting_chunks: AtomicU64,
    pub items_completed: AtomicU64,
    pub handler_errors: AtomicU64,
    pub hash_queries: AtomicU64,
}

/// Point-in-time copy of `ReceiverStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStatsSnapshot {
    pub datagrams: u64,
    pub malformed: u64,
    pub integrity_drops: u64,
    pub sessions_opened: u64,
    pub sessions_rejected: u64,
    pub sessions_swept: u64,
    pub duplicate_chunks: u64,
    pub conflicting_chunks: u64,
    pub items_completed: u64,
    pub handler_errors: u64,
    pub hash_queries: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReceiverStatsSnapshot {
        ReceiverStatsSnapshot {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            integrity_drops: self.integrity_drops.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            sessions_swept: self.sessions_swept.load(Ordering::Relaxed),
            duplicate_chunks: self.duplicate_chunks.load(Ordering::Relaxed),
            conflicting_chunks: self.conflicting_chunks.load(Ordering::Relaxed),
            items_completed: self.items_completed.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            hash_queries: self.hash_queries.load(Ordering::Relaxed),
        }
    }
}
