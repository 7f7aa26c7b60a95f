/// Receiver engine.
///
/// One task owns the socket and the session table. Every datagram is
/// decoded, authenticated and dispatched in turn:
///
/// - data packets are stored into their session and acknowledged; the last
///   missing chunk finalizes the item and hands it to the `ItemHandler`
///   before its ack goes out
/// - hash requests are answered from the retained hashes or the handler's
///   existing data
///
/// Nothing a peer sends can stop the loop. Only the shutdown token or a
/// fatal socket error ends it.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crypto::{PacketCipher, content_hash};
use crate::error::ReceiverError;
use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::protocol::{MAX_DATAGRAM, Packet, PacketHeader, PacketKind};
use crate::session::{Accepted, HashLookup, SessionTable};
use crate::stats::{ReceiverStats, ReceiverStatsSnapshot};
use crate::transport::{Transport, is_transient_recv};

const COMPONENT: &str = "receiver";

/// Application side of the receiver.
///
/// Both methods are called from the receive loop and should return promptly.
pub trait ItemHandler: Send + Sync {
    /// A complete, authenticated item arrived. Called once per session.
    fn item_completed(&self, name: &str, data: &[u8]) -> anyhow::Result<()>;

    /// Data already held under `name`, used to answer "do you have this?"
    /// queries for items this receiver did not assemble itself.
    fn provide_existing_data(&self, _name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

enum LoopEvent {
    Shutdown,
    Sweep,
    Datagram(io::Result<(usize, SocketAddr)>),
}

pub struct Receiver {
    transport: Transport,
    cipher: PacketCipher,
    config: Config,
    handler: Arc<dyn ItemHandler>,
    logger: Arc<dyn TransferLogger>,
    stats: Arc<ReceiverStats>,
}

impl Receiver {
    /// Validate the inputs and bind the listening socket.
    pub fn bind(
        addr: SocketAddr,
        key: &[u8],
        config: Config,
        handler: Arc<dyn ItemHandler>,
    ) -> Result<Self, ReceiverError> {
        config.validate().map_err(ReceiverError::InvalidConfig)?;
        let cipher = PacketCipher::new(key)?;
        let transport = Transport::bind(addr, config.socket_buffer_size)?;
        let logger: Arc<dyn TransferLogger> = Arc::new(TracingLogger::new(config.verbose_logging));
        Ok(Self {
            transport,
            cipher,
            config,
            handler,
            logger,
            stats: Arc::new(ReceiverStats::new()),
        })
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        self.stats.clone()
    }

    /// Run the receive loop until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ReceiverError> {
        let mut table = SessionTable::new(&self.config);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        sweep.tick().await;

        let bind_addr = self
            .transport
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        self.log(0, TransferEvent::ListenerStarted { bind_addr });

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => LoopEvent::Shutdown,
                _ = sweep.tick() => LoopEvent::Sweep,
                received = self.transport.recv_from(&mut buf) => LoopEvent::Datagram(received),
            };

            match event {
                LoopEvent::Shutdown => break,
                LoopEvent::Sweep => self.sweep(&mut table),
                LoopEvent::Datagram(Ok((len, from))) => {
                    self.handle_datagram(&mut table, &buf[..len], from).await;
                }
                // Windows reports ICMP port unreachable from an earlier send here.
                LoopEvent::Datagram(Err(e)) if is_transient_recv(&e) => continue,
                LoopEvent::Datagram(Err(e)) => {
                    tracing::error!("receive failed: {}", e);
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            active_sessions = table.active_len(),
            "receiver shutting down"
        );
        Ok(())
    }

    /// Run the loop on its own task.
    pub fn spawn(self) -> Result<ReceiverHandle, ReceiverError> {
        let local_addr = self.local_addr()?;
        let stats = self.stats();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(shutdown.clone()));
        Ok(ReceiverHandle {
            local_addr,
            stats,
            shutdown,
            task,
        })
    }

    async fn handle_datagram(&self, table: &mut SessionTable, datagram: &[u8], from: SocketAddr) {
        ReceiverStats::bump(&self.stats.datagrams);

        let packet = match Packet::decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                ReceiverStats::bump(&self.stats.malformed);
                self.log(
                    0,
                    TransferEvent::DatagramDropped {
                        from,
                        reason: e.to_string(),
                    },
                );
                return;
            }
        };

        // Unauthenticated packets never get a reply.
        let plaintext = match self.cipher.open(&packet) {
            Ok(p) => p,
            Err(e) => {
                ReceiverStats::bump(&self.stats.integrity_drops);
                self.log(
                    packet.header.session_id,
                    TransferEvent::DatagramDropped {
                        from,
                        reason: e.to_string(),
                    },
                );
                return;
            }
        };

        match packet.header.kind {
            PacketKind::Data => self.on_data(table, from, &packet.header, plaintext).await,
            PacketKind::HashRequest => self.on_hash_request(table, from, &packet.header).await,
            PacketKind::Ack | PacketKind::HashReply => {
                self.log(
                    packet.header.session_id,
                    TransferEvent::DatagramDropped {
                        from,
                        reason: format!("unexpected {:?} packet", packet.header.kind),
                    },
                );
            }
        }
    }

    async fn on_data(
        &self,
        table: &mut SessionTable,
        from: SocketAddr,
        header: &PacketHeader,
        plaintext: Vec<u8>,
    ) {
        let sid = header.session_id;
        let accepted = match table.accept_chunk(from, header, Bytes::from(plaintext), Instant::now())
        {
            Ok(a) => a,
            Err(reason) => {
                ReceiverStats::bump(&self.stats.sessions_rejected);
                self.log(
                    sid,
                    TransferEvent::SessionRejected {
                        from,
                        reason: reason.to_string(),
                    },
                );
                return;
            }
        };

        match accepted {
            Accepted::Stored {
                opened,
                received,
                total,
            } => {
                if opened {
                    self.session_opened(header, from);
                }
                self.log(
                    sid,
                    TransferEvent::ChunkStored {
                        index: header.sequence,
                        received,
                        total,
                    },
                );
            }
            Accepted::Duplicate => ReceiverStats::bump(&self.stats.duplicate_chunks),
            Accepted::Conflict => {
                ReceiverStats::bump(&self.stats.conflicting_chunks);
                self.log(
                    sid,
                    TransferEvent::ChunkConflict {
                        index: header.sequence,
                    },
                );
            }
            Accepted::AlreadyFinished => {}
            Accepted::Completed {
                opened,
                name,
                data,
                hash,
            } => {
                if opened {
                    self.session_opened(header, from);
                }
                ReceiverStats::bump(&self.stats.items_completed);
                self.log(
                    sid,
                    TransferEvent::ItemCompleted {
                        name: name.clone(),
                        bytes: data.len(),
                        hash,
                    },
                );
                if let Err(e) = self.handler.item_completed(&name, &data) {
                    ReceiverStats::bump(&self.stats.handler_errors);
                    self.log(
                        sid,
                        TransferEvent::HandlerFailed {
                            name,
                            message: format!("{:#}", e),
                        },
                    );
                }
            }
        }

        self.reply(header.reply(PacketKind::Ack), &[], from).await;
    }

    async fn on_hash_request(&self, table: &SessionTable, from: SocketAddr, header: &PacketHeader) {
        ReceiverStats::bump(&self.stats.hash_queries);

        let hash = match table.lookup_hash(from, header) {
            HashLookup::Pending => None,
            HashLookup::Known(hash) => Some(hash),
            HashLookup::Unknown => match self.handler.provide_existing_data(&header.name) {
                Ok(Some(data)) => Some(content_hash(&data)),
                Ok(None) => None,
                Err(e) => {
                    ReceiverStats::bump(&self.stats.handler_errors);
                    self.log(
                        header.session_id,
                        TransferEvent::HandlerFailed {
                            name: header.name.clone(),
                            message: format!("{:#}", e),
                        },
                    );
                    None
                }
            },
        };

        self.log(
            header.session_id,
            TransferEvent::HashServed {
                name: header.name.clone(),
                found: hash.is_some(),
            },
        );
        let payload: &[u8] = match &hash {
            Some(h) => h,
            None => &[],
        };
        self.reply(header.reply(PacketKind::HashReply), payload, from)
            .await;
    }

    fn session_opened(&self, header: &PacketHeader, from: SocketAddr) {
        ReceiverStats::bump(&self.stats.sessions_opened);
        self.log(
            header.session_id,
            TransferEvent::SessionOpened {
                name: header.name.clone(),
                total: header.total,
                from,
            },
        );
    }

    /// Seal and send a control packet. Failures only cost the peer a retry.
    async fn reply(&self, header: PacketHeader, payload: &[u8], to: SocketAddr) {
        let sid = header.session_id;
        let packet = match self.cipher.seal(header, payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(session_id = %format!("{:016x}", sid), "seal failed: {}", e);
                return;
            }
        };
        if let Err(e) = self.transport.send_to(&packet.encode(), to).await {
            tracing::warn!(session_id = %format!("{:016x}", sid), "reply to {} failed: {}", to, e);
        }
    }

    fn sweep(&self, table: &mut SessionTable) {
        let report = table.sweep(Instant::now());
        if report.is_empty() {
            return;
        }
        self.stats
            .sessions_swept
            .fetch_add(report.sessions as u64, Ordering::Relaxed);
        self.log(
            0,
            TransferEvent::Swept {
                sessions: report.sessions,
                finished: report.finished,
                hashes: report.hashes,
            },
        );
    }

    fn log(&self, session_id: u64, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            session_id,
            event,
        });
    }
}

/// Handle to a receiver running on its own task.
pub struct ReceiverHandle {
    local_addr: SocketAddr,
    stats: Arc<ReceiverStats>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ReceiverError>>,
}

impl ReceiverHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> ReceiverStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) -> Result<(), ReceiverError> {
        self.shutdown.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ReceiverError::Transport(io::Error::other(e))),
        }
    }
}

/// Bind on all IPv4 interfaces at `port` and receive until `shutdown` fires.
pub async fn run_receiver(
    port: u16,
    key: &[u8],
    config: Config,
    handler: Arc<dyn ItemHandler>,
    shutdown: CancellationToken,
) -> Result<(), ReceiverError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    Receiver::bind(addr, key, config, handler)?
        .run(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullLogger;
    use std::sync::Mutex;
    use std::time::Duration;

    const KEY: &[u8; 32] = b"aA2Xh41FiC4Wtj3e5b2LbytMdn6on7P0";

    #[derive(Default)]
    struct Collect {
        items: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl ItemHandler for Collect {
        fn item_completed(&self, name: &str, data: &[u8]) -> anyhow::Result<()> {
            self.items
                .lock()
                .unwrap()
                .push((name.to_owned(), data.to_vec()));
            Ok(())
        }
    }

    fn spawn_receiver(handler: Arc<dyn ItemHandler>) -> ReceiverHandle {
        Receiver::bind("127.0.0.1:0".parse().unwrap(), KEY, Config::default(), handler)
            .unwrap()
            .with_logger(Arc::new(NullLogger))
            .spawn()
            .unwrap()
    }

    async fn exchange(peer: &Transport, to: SocketAddr, datagram: &[u8]) -> Option<Packet> {
        peer.send_to(datagram, to).await.unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        peer.recv_until(&mut buf, deadline)
            .await
            .unwrap()
            .map(|(len, _)| Packet::decode(&buf[..len]).unwrap())
    }

    #[test]
    fn rejects_bad_key_and_config() {
        let handler: Arc<dyn ItemHandler> = Arc::new(Collect::default());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(matches!(
            Receiver::bind(addr, b"short", Config::default(), handler.clone()),
            Err(ReceiverError::Crypto(_))
        ));
        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(matches!(
            Receiver::bind(addr, KEY, config, handler),
            Err(ReceiverError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn acks_data_and_serves_hash() {
        let collect = Arc::new(Collect::default());
        let handle = spawn_receiver(collect.clone());
        let cipher = PacketCipher::new(KEY).unwrap();
        let peer = Transport::bind("127.0.0.1:0".parse().unwrap(), 64 * 1024).unwrap();

        let data = cipher
            .seal(PacketHeader::new(PacketKind::Data, 42, 0, 1, "one"), b"payload")
            .unwrap();
        let ack = exchange(&peer, handle.local_addr(), &data.encode())
            .await
            .expect("ack");
        assert_eq!(ack.header.kind, PacketKind::Ack);
        assert_eq!(ack.header.session_id, 42);
        assert!(cipher.open(&ack).unwrap().is_empty());

        let query = cipher
            .seal(PacketHeader::new(PacketKind::HashRequest, 42, 0, 0, "one"), &[])
            .unwrap();
        let reply = exchange(&peer, handle.local_addr(), &query.encode())
            .await
            .expect("hash reply");
        assert_eq!(reply.header.kind, PacketKind::HashReply);
        assert_eq!(cipher.open(&reply).unwrap(), content_hash(b"payload"));

        assert_eq!(
            collect.items.lock().unwrap().as_slice(),
            &[("one".to_string(), b"payload".to_vec())]
        );
        let stats = handle.stats();
        assert_eq!(stats.items_completed, 1);
        assert_eq!(stats.hash_queries, 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ignores_garbage_and_forgeries() {
        let handle = spawn_receiver(Arc::new(Collect::default()));
        let peer = Transport::bind("127.0.0.1:0".parse().unwrap(), 64 * 1024).unwrap();

        assert!(exchange(&peer, handle.local_addr(), b"not a packet").await.is_none());

        let forged = PacketCipher::new(&[7u8; 32])
            .unwrap()
            .seal(PacketHeader::new(PacketKind::Data, 1, 0, 1, "x"), b"evil")
            .unwrap();
        assert!(exchange(&peer, handle.local_addr(), &forged.encode()).await.is_none());

        let stats = handle.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.integrity_drops, 1);
        assert_eq!(stats.items_completed, 0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_name_gets_empty_reply() {
        let handle = spawn_receiver(Arc::new(Collect::default()));
        let cipher = PacketCipher::new(KEY).unwrap();
        let peer = Transport::bind("127.0.0.1:0".parse().unwrap(), 64 * 1024).unwrap();

        let query = cipher
            .seal(PacketHeader::new(PacketKind::HashRequest, 5, 0, 0, "nothing"), &[])
            .unwrap();
        let reply = exchange(&peer, handle.local_addr(), &query.encode())
            .await
            .expect("hash reply");
        assert!(cipher.open(&reply).unwrap().is_empty());
        handle.shutdown().await.unwrap();
    }
}
