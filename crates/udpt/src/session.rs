/// Receiver-side session table.
///
/// Owned by the accept loop and mutated only from there, so it needs no
/// locking. Time is passed in explicitly, which keeps the sweep logic
/// testable without sleeping.
///
/// Three maps:
/// - `active`: in-progress reassemblies keyed by (source address, session id)
/// - `finished`: completed sessions and their hashes; late retransmits for
///   these are acknowledged but never reassembled again, and confirmation
///   queries from the session get its own hash
/// - `completed`: newest hash per item name, for existing-data queries from
///   sessions this receiver has not seen

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::Config;
use crate::crypto::content_hash;
use crate::error::FrameError;
use crate::framer::{ChunkInsert, Reassembly};
use crate::protocol::{HASH_SIZE, PacketHeader};

pub type SessionKey = (SocketAddr, u64);

/// In-progress reassembly of one item.
#[derive(Debug)]
struct Session {
    name: String,
    expected_total: u32,
    last_activity: Instant,
    chunks: Reassembly,
}

impl Session {
    fn new(header: &PacketHeader, now: Instant) -> Self {
        Self {
            name: header.name.clone(),
            expected_total: header.total,
            last_activity: now,
            chunks: Reassembly::new(header.total),
        }
    }
}

/// Hash of a completed item and when it completed.
#[derive(Debug, Clone, Copy)]
struct CompletedHash {
    hash: [u8; HASH_SIZE],
    at: Instant,
}

/// What happened to an accepted chunk.
#[derive(Debug)]
pub enum Accepted {
    Stored {
        opened: bool,
        received: usize,
        total: u32,
    },
    Duplicate,
    /// Different bytes at a filled index; the first copy was kept.
    Conflict,
    /// Session already completed; acknowledge only.
    AlreadyFinished,
    /// Last missing chunk arrived. The session has been removed.
    Completed {
        opened: bool,
        name: String,
        data: Vec<u8>,
        hash: [u8; HASH_SIZE],
    },
}

#[derive(Debug)]
pub enum Rejected {
    TooManySessions(usize),
    HeaderMismatch,
    ItemTooLarge { limit: usize },
    Frame(FrameError),
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejected::TooManySessions(n) => write!(f, "session limit of {} reached", n),
            Rejected::HeaderMismatch => write!(f, "name or total differs from the session"),
            Rejected::ItemTooLarge { limit } => write!(f, "item exceeds {} bytes", limit),
            Rejected::Frame(e) => write!(f, "{}", e),
        }
    }
}

/// Answer to a hash query, before falling back to the data provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashLookup {
    /// The querying session is still being reassembled.
    Pending,
    Known([u8; HASH_SIZE]),
    Unknown,
}

/// Counts removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub finished: usize,
    pub hashes: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.sessions == 0 && self.finished == 0 && self.hashes == 0
    }
}

pub struct SessionTable {
    active: HashMap<SessionKey, Session>,
    finished: HashMap<SessionKey, CompletedHash>,
    completed: HashMap<String, CompletedHash>,
    max_sessions: usize,
    max_item_size: usize,
    session_timeout: Duration,
    hash_retention: Duration,
}

impl SessionTable {
    pub fn new(config: &Config) -> Self {
        Self {
            active: HashMap::new(),
            finished: HashMap::new(),
            completed: HashMap::new(),
            max_sessions: config.max_sessions,
            max_item_size: config.max_item_size,
            session_timeout: config.session_timeout,
            hash_retention: config.hash_retention,
        }
    }

    /// Store the chunk of a data packet from `from`.
    pub fn accept_chunk(
        &mut self,
        from: SocketAddr,
        header: &PacketHeader,
        chunk: Bytes,
        now: Instant,
    ) -> Result<Accepted, Rejected> {
        let key = (from, header.session_id);
        if self.finished.contains_key(&key) {
            return Ok(Accepted::AlreadyFinished);
        }

        let opened = !self.active.contains_key(&key);
        if opened {
            if self.active.len() >= self.max_sessions {
                return Err(Rejected::TooManySessions(self.max_sessions));
            }
            // Every chunk but a lone empty one carries at least one byte.
            if header.total as usize > self.max_item_size.max(1) {
                return Err(Rejected::ItemTooLarge {
                    limit: self.max_item_size,
                });
            }
            self.active.insert(key, Session::new(header, now));
        }

        let Some(session) = self.active.get_mut(&key) else {
            return Err(Rejected::HeaderMismatch);
        };
        if session.name != header.name || session.expected_total != header.total {
            return Err(Rejected::HeaderMismatch);
        }
        session.last_activity = now;

        let outcome = session
            .chunks
            .insert(header.sequence, chunk)
            .map_err(Rejected::Frame)?;
        match outcome {
            ChunkInsert::Duplicate => return Ok(Accepted::Duplicate),
            ChunkInsert::Conflict => return Ok(Accepted::Conflict),
            ChunkInsert::Stored => {}
        }

        // Only new bytes count against the limit.
        if session.chunks.bytes() > self.max_item_size {
            self.active.remove(&key);
            return Err(Rejected::ItemTooLarge {
                limit: self.max_item_size,
            });
        }

        if !session.chunks.is_complete() {
            return Ok(Accepted::Stored {
                opened,
                received: session.chunks.received(),
                total: session.expected_total,
            });
        }

        let Some(session) = self.active.remove(&key) else {
            return Err(Rejected::HeaderMismatch);
        };
        let name = session.name;
        let data = session.chunks.finish().map_err(Rejected::Frame)?;
        let hash = content_hash(&data);

        let done = CompletedHash { hash, at: now };
        self.finished.insert(key, done);
        self.completed.insert(name.clone(), done);

        Ok(Accepted::Completed {
            opened,
            name,
            data,
            hash,
        })
    }

    /// Hash held for the item queried by `header`.
    ///
    /// A finished session is answered with its own hash, even when another
    /// sender has since completed an item under the same name.
    pub fn lookup_hash(&self, from: SocketAddr, header: &PacketHeader) -> HashLookup {
        let key = (from, header.session_id);
        if self.active.contains_key(&key) {
            return HashLookup::Pending;
        }
        if let Some(done) = self.finished.get(&key) {
            return HashLookup::Known(done.hash);
        }
        match self.completed.get(&header.name) {
            Some(done) => HashLookup::Known(done.hash),
            None => HashLookup::Unknown,
        }
    }

    /// Drop idle sessions and expired hashes.
    ///
    /// Finished-session markers live as long as hashes do, so a replayed
    /// session is recognised for the whole retention window.
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let timeout = self.session_timeout;
        let retention = self.hash_retention.max(self.session_timeout);

        let before = self.active.len();
        self.active
            .retain(|_, s| now.saturating_duration_since(s.last_activity) < timeout);
        let sessions = before - self.active.len();

        let before = self.finished.len();
        self.finished
            .retain(|_, done| now.saturating_duration_since(done.at) < retention);
        let finished = before - self.finished.len();

        let before = self.completed.len();
        self.completed
            .retain(|_, done| now.saturating_duration_since(done.at) < retention);
        let hashes = before - self.completed.len();

        SweepReport {
            sessions,
            finished,
            hashes,
        }
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketKind;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn data(session_id: u64, seq: u32, total: u32, name: &str) -> PacketHeader {
        PacketHeader::new(PacketKind::Data, session_id, seq, total, name)
    }

    fn table() -> SessionTable {
        SessionTable::new(&Config {
            session_timeout: Duration::from_secs(10),
            hash_retention: Duration::from_secs(60),
            max_sessions: 2,
            max_item_size: 16,
            ..Config::default()
        })
    }

    #[test]
    fn completes_out_of_order() {
        let mut t = table();
        let now = Instant::now();
        let a = addr(1000);

        let r = t
            .accept_chunk(a, &data(1, 1, 2, "x"), Bytes::from_static(b"lo"), now)
            .unwrap();
        assert!(matches!(r, Accepted::Stored { opened: true, received: 1, total: 2 }));

        match t
            .accept_chunk(a, &data(1, 0, 2, "x"), Bytes::from_static(b"hel"), now)
            .unwrap()
        {
            Accepted::Completed { name, data, hash, opened } => {
                assert!(!opened);
                assert_eq!(name, "x");
                assert_eq!(data, b"hello");
                assert_eq!(hash, content_hash(b"hello"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(t.active_len(), 0);
        let confirm = PacketHeader::new(PacketKind::HashRequest, 1, 0, 2, "x");
        assert_eq!(t.lookup_hash(a, &confirm), HashLookup::Known(content_hash(b"hello")));

        // Late retransmit after completion is acknowledged only.
        assert!(matches!(
            t.accept_chunk(a, &data(1, 0, 2, "x"), Bytes::from_static(b"hel"), now)
                .unwrap(),
            Accepted::AlreadyFinished
        ));
    }

    #[test]
    fn sessions_are_keyed_by_source() {
        let mut t = table();
        let now = Instant::now();
        t.accept_chunk(addr(1), &data(9, 0, 2, "a"), Bytes::from_static(b"1"), now)
            .unwrap();
        t.accept_chunk(addr(2), &data(9, 0, 2, "b"), Bytes::from_static(b"2"), now)
            .unwrap();
        assert_eq!(t.active_len(), 2);

        let query = PacketHeader::new(PacketKind::HashRequest, 9, 0, 2, "a");
        assert_eq!(t.lookup_hash(addr(1), &query), HashLookup::Pending);
        assert_eq!(t.lookup_hash(addr(2), &query), HashLookup::Pending);
        assert!(matches!(
            t.accept_chunk(addr(1), &data(9, 1, 2, "b"), Bytes::from_static(b"x"), now),
            Err(Rejected::HeaderMismatch)
        ));
    }

    #[test]
    fn duplicate_and_conflict() {
        let mut t = table();
        let now = Instant::now();
        let h = data(3, 0, 2, "x");
        t.accept_chunk(addr(1), &h, Bytes::from_static(b"ab"), now).unwrap();
        assert!(matches!(
            t.accept_chunk(addr(1), &h, Bytes::from_static(b"ab"), now).unwrap(),
            Accepted::Duplicate
        ));
        assert!(matches!(
            t.accept_chunk(addr(1), &h, Bytes::from_static(b"zz"), now).unwrap(),
            Accepted::Conflict
        ));
    }

    #[test]
    fn duplicate_near_size_limit_is_idempotent() {
        let mut t = table();
        let now = Instant::now();
        let a = addr(1);
        let first = data(4, 0, 2, "big");

        t.accept_chunk(a, &first, Bytes::from(vec![7u8; 10]), now)
            .unwrap();
        // A retransmit of a stored index adds no bytes, so it cannot trip the limit.
        assert!(matches!(
            t.accept_chunk(a, &first, Bytes::from(vec![7u8; 10]), now).unwrap(),
            Accepted::Duplicate
        ));
        assert_eq!(t.active_len(), 1);

        match t
            .accept_chunk(a, &data(4, 1, 2, "big"), Bytes::from(vec![8u8; 6]), now)
            .unwrap()
        {
            Accepted::Completed { data, .. } => assert_eq!(data.len(), 16),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_header_disagreement() {
        let mut t = table();
        let now = Instant::now();
        t.accept_chunk(addr(1), &data(3, 0, 2, "x"), Bytes::from_static(b"a"), now)
            .unwrap();
        assert!(matches!(
            t.accept_chunk(addr(1), &data(3, 1, 3, "x"), Bytes::from_static(b"b"), now),
            Err(Rejected::HeaderMismatch)
        ));
        assert!(matches!(
            t.accept_chunk(addr(1), &data(3, 1, 2, "y"), Bytes::from_static(b"b"), now),
            Err(Rejected::HeaderMismatch)
        ));
    }

    #[test]
    fn enforces_limits() {
        let mut t = table();
        let now = Instant::now();
        t.accept_chunk(addr(1), &data(1, 0, 2, "a"), Bytes::from_static(b"a"), now)
            .unwrap();
        t.accept_chunk(addr(1), &data(2, 0, 2, "b"), Bytes::from_static(b"b"), now)
            .unwrap();
        assert!(matches!(
            t.accept_chunk(addr(1), &data(3, 0, 2, "c"), Bytes::from_static(b"c"), now),
            Err(Rejected::TooManySessions(2))
        ));

        let mut t = table();
        assert!(matches!(
            t.accept_chunk(addr(1), &data(1, 0, 100, "big"), Bytes::from_static(b"a"), now),
            Err(Rejected::ItemTooLarge { limit: 16 })
        ));

        let mut t = table();
        t.accept_chunk(addr(1), &data(1, 0, 2, "big"), Bytes::from(vec![0u8; 10]), now)
            .unwrap();
        assert!(matches!(
            t.accept_chunk(addr(1), &data(1, 1, 2, "big"), Bytes::from(vec![0u8; 10]), now),
            Err(Rejected::ItemTooLarge { .. })
        ));
        assert_eq!(t.active_len(), 0);
    }

    #[test]
    fn sweep_drops_idle_sessions_without_resurrection() {
        let mut t = table();
        let start = Instant::now();
        let a = addr(1);

        t.accept_chunk(a, &data(5, 0, 2, "x"), Bytes::from_static(b"he"), start)
            .unwrap();

        assert!(t.sweep(start + Duration::from_secs(5)).is_empty());
        assert_eq!(t.active_len(), 1);

        let report = t.sweep(start + Duration::from_secs(11));
        assert_eq!(report.sessions, 1);
        assert_eq!(t.active_len(), 0);

        // The second chunk alone opens a fresh session instead of completing the old one.
        let r = t
            .accept_chunk(a, &data(5, 1, 2, "x"), Bytes::from_static(b"llo"), start + Duration::from_secs(12))
            .unwrap();
        assert!(matches!(r, Accepted::Stored { opened: true, received: 1, .. }));
    }

    #[test]
    fn sweep_expires_hashes_and_markers() {
        let mut t = table();
        let start = Instant::now();
        let a = addr(1);
        t.accept_chunk(a, &data(5, 0, 1, "x"), Bytes::from_static(b"x"), start)
            .unwrap();

        let query = PacketHeader::new(PacketKind::HashRequest, 77, 0, 0, "x");
        assert_eq!(t.lookup_hash(a, &query), HashLookup::Known(content_hash(b"x")));

        // Past the session timeout the marker and hash are still held.
        assert!(t.sweep(start + Duration::from_secs(11)).is_empty());

        let report = t.sweep(start + Duration::from_secs(61));
        assert_eq!(report.finished, 1);
        assert_eq!(report.hashes, 1);
        assert_eq!(t.lookup_hash(a, &query), HashLookup::Unknown);
    }

    #[test]
    fn replay_within_retention_does_not_complete_again() {
        let mut t = table();
        let start = Instant::now();
        let a = addr(1);
        let packet = data(5, 0, 1, "x");

        assert!(matches!(
            t.accept_chunk(a, &packet, Bytes::from_static(b"x"), start).unwrap(),
            Accepted::Completed { .. }
        ));

        let later = start + Duration::from_secs(30);
        t.sweep(later);
        assert!(matches!(
            t.accept_chunk(a, &packet, Bytes::from_static(b"x"), later).unwrap(),
            Accepted::AlreadyFinished
        ));
    }

    #[test]
    fn finished_session_gets_its_own_hash() {
        let mut t = table();
        let now = Instant::now();
        let (a, b) = (addr(1), addr(2));

        t.accept_chunk(a, &data(1, 0, 1, "x"), Bytes::from_static(b"from-a"), now)
            .unwrap();
        t.accept_chunk(b, &data(2, 0, 1, "x"), Bytes::from_static(b"from-b"), now)
            .unwrap();

        let confirm_a = PacketHeader::new(PacketKind::HashRequest, 1, 0, 1, "x");
        assert_eq!(
            t.lookup_hash(a, &confirm_a),
            HashLookup::Known(content_hash(b"from-a"))
        );
        let confirm_b = PacketHeader::new(PacketKind::HashRequest, 2, 0, 1, "x");
        assert_eq!(
            t.lookup_hash(b, &confirm_b),
            HashLookup::Known(content_hash(b"from-b"))
        );

        // A session the table has never seen gets the newest hash for the name.
        let precheck = PacketHeader::new(PacketKind::HashRequest, 3, 0, 0, "x");
        assert_eq!(
            t.lookup_hash(addr(3), &precheck),
            HashLookup::Known(content_hash(b"from-b"))
        );
    }

    #[test]
    fn lookup_reports_pending_for_own_session() {
        let mut t = table();
        let now = Instant::now();
        let a = addr(1);
        t.accept_chunk(a, &data(5, 0, 1, "x"), Bytes::from_static(b"old"), now)
            .unwrap();
        t.accept_chunk(a, &data(6, 0, 2, "x"), Bytes::from_static(b"n"), now)
            .unwrap();

        let own = PacketHeader::new(PacketKind::HashRequest, 6, 0, 0, "x");
        assert_eq!(t.lookup_hash(a, &own), HashLookup::Pending);

        let other = PacketHeader::new(PacketKind::HashRequest, 7, 0, 0, "x");
        assert_eq!(t.lookup_hash(a, &other), HashLookup::Known(content_hash(b"old")));
    }
}
