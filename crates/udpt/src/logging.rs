/// Structured transfer events.
///
/// Sender and receiver report what they do as `TransferEvent`s through a
/// `TransferLogger`. The default `TracingLogger` forwards them to `tracing`;
/// tests use `NullLogger`.

use std::fmt;
use std::net::SocketAddr;

/// Structured log entry for one session.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub session_id: u64,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Sender: state machine moved on
    StateChanged {
        from: &'static str,
        to: &'static str,
    },
    /// Sender: item split and sealed
    Framed {
        name: String,
        bytes: usize,
        packets: u32,
    },
    /// Sender: one data packet went out
    PacketSent {
        index: u32,
        retransmit: bool,
    },
    /// Sender: a resend round started
    RetransmitRound {
        round: u32,
        missing: u32,
    },
    /// Sender: receiver acknowledged a packet
    Acked {
        index: u32,
    },
    /// Sender: hash query sent
    HashQueried {
        attempt: u32,
    },
    /// Sender: hash reply received
    HashAnswered {
        matched: bool,
        hash: Option<[u8; 32]>,
    },
    /// Sender: transfer outcome
    TransferConfirmed {
        name: String,
        short_circuited: bool,
        retransmits: u64,
        duration_ms: u64,
    },
    TransferFailed {
        reason: String,
    },
    /// Receiver: accept loop started
    ListenerStarted {
        bind_addr: String,
    },
    /// Receiver: first packet of an unseen session
    SessionOpened {
        name: String,
        total: u32,
        from: SocketAddr,
    },
    /// Receiver: chunk stored
    ChunkStored {
        index: u32,
        received: usize,
        total: u32,
    },
    /// Receiver: same index arrived with different bytes, first copy kept
    ChunkConflict {
        index: u32,
    },
    /// Receiver: all chunks present, callback invoked
    ItemCompleted {
        name: String,
        bytes: usize,
        hash: [u8; 32],
    },
    /// Receiver: completion callback returned an error
    HandlerFailed {
        name: String,
        message: String,
    },
    /// Receiver: answered a hash query
    HashServed {
        name: String,
        found: bool,
    },
    /// Receiver: datagram could not be decoded or authenticated
    DatagramDropped {
        from: SocketAddr,
        reason: String,
    },
    /// Receiver: packet refused for a session (limits, mismatched header)
    SessionRejected {
        from: SocketAddr,
        reason: String,
    },
    /// Receiver: stale state removed
    Swept {
        sessions: usize,
        finished: usize,
        hashes: usize,
    },
}

impl TransferEvent {
    /// Per-packet events, only logged in verbose mode.
    pub fn is_per_packet(&self) -> bool {
        matches!(
            self,
            Self::PacketSent { .. }
                | Self::Acked { .. }
                | Self::ChunkStored { .. }
                | Self::HashQueried { .. }
                | Self::DatagramDropped { .. }
        )
    }
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged { from, to } => write!(f, "state {} -> {}", from, to),
            Self::Framed { name, bytes, packets } => {
                write!(f, "framed name={} bytes={} packets={}", name, bytes, packets)
            }
            Self::PacketSent { index, retransmit } => {
                write!(f, "packet_sent idx={} retransmit={}", index, retransmit)
            }
            Self::RetransmitRound { round, missing } => {
                write!(f, "retransmit_round round={} missing={}", round, missing)
            }
            Self::Acked { index } => write!(f, "acked idx={}", index),
            Self::HashQueried { attempt } => write!(f, "hash_queried attempt={}", attempt),
            Self::HashAnswered { matched, hash } => match hash {
                Some(h) => write!(f, "hash_answered matched={} hash={}", matched, hex::encode(h)),
                None => write!(f, "hash_answered matched={} hash=none", matched),
            },
            Self::TransferConfirmed {
                name,
                short_circuited,
                retransmits,
                duration_ms,
            } => write!(
                f,
                "transfer_confirmed name={} short_circuited={} retransmits={} duration_ms={}",
                name, short_circuited, retransmits, duration_ms
            ),
            Self::TransferFailed { reason } => write!(f, "transfer_failed: {}", reason),
            Self::ListenerStarted { bind_addr } => write!(f, "listener_started bind={}", bind_addr),
            Self::SessionOpened { name, total, from } => {
                write!(f, "session_opened name={} total={} from={}", name, total, from)
            }
            Self::ChunkStored { index, received, total } => {
                write!(f, "chunk_stored idx={} received={}/{}", index, received, total)
            }
            Self::ChunkConflict { index } => {
                write!(f, "chunk_conflict idx={} (kept first copy)", index)
            }
            Self::ItemCompleted { name, bytes, hash } => write!(
                f,
                "item_completed name={} bytes={} sha256={}",
                name,
                bytes,
                hex::encode(hash)
            ),
            Self::HandlerFailed { name, message } => {
                write!(f, "handler_failed name={}: {}", name, message)
            }
            Self::HashServed { name, found } => {
                write!(f, "hash_served name={} found={}", name, found)
            }
            Self::DatagramDropped { from, reason } => {
                write!(f, "datagram_dropped from={}: {}", from, reason)
            }
            Self::SessionRejected { from, reason } => {
                write!(f, "session_rejected from={}: {}", from, reason)
            }
            Self::Swept { sessions, finished, hashes } => write!(
                f,
                "swept sessions={} finished={} hashes={}",
                sessions, finished, hashes
            ),
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing,
/// collect entries, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger {
    verbose: bool,
}

impl TracingLogger {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        if entry.event.is_per_packet() && !self.verbose {
            return;
        }
        let sid = format!("{:016x}", entry.session_id);
        match &entry.event {
            TransferEvent::HandlerFailed { .. }
            | TransferEvent::ChunkConflict { .. }
            | TransferEvent::SessionRejected { .. }
            | TransferEvent::TransferFailed { .. } => {
                tracing::warn!(component = entry.component, session_id = %sid, "{}", entry.event);
            }
            TransferEvent::ListenerStarted { .. }
            | TransferEvent::ItemCompleted { .. }
            | TransferEvent::TransferConfirmed { .. } => {
                tracing::info!(component = entry.component, session_id = %sid, "{}", entry.event);
            }
            _ => {
                tracing::debug!(component = entry.component, session_id = %sid, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
