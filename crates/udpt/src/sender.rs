/// Sender engine.
///
/// One call to `Sender::send` is one transfer on its own ephemeral socket:
///
/// 1. Framing: hash the item, split it and seal every chunk once
/// 2. Sending: blast all packets, then resend whatever is unacknowledged
///    after each retry interval until everything is acked
/// 3. Confirmation: ask the receiver for its hash of the item and compare
///
/// An optional existing-data check before framing skips the transfer when
/// the receiver already holds identical bytes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::bitfield::IndexBitfield;
use crate::config::Config;
use crate::crypto::{PacketCipher, content_hash};
use crate::error::{FrameError, Phase, TimeoutCause, TransferError};
use crate::framer::{Item, split};
use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::protocol::{HASH_SIZE, MAX_DATAGRAM, Packet, PacketHeader, PacketKind, validate_name};
use crate::transport::Transport;

const COMPONENT: &str = "sender";

/// Per-call transfer options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Ask the receiver for its hash of `name` first and skip the transfer on a match.
    pub check_existing: bool,
    /// Overrides `Config::transfer_deadline` for this call.
    pub deadline: Option<Duration>,
}

/// Outcome of a confirmed transfer.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub session_id: u64,
    pub name: String,
    /// Data packets the item was framed into. Zero when short-circuited.
    pub packets: u32,
    pub retransmits: u64,
    pub hash: [u8; HASH_SIZE],
    pub short_circuited: bool,
    pub elapsed: Duration,
}

impl TransferReport {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Framing,
    Sending,
    AwaitingConfirmation,
    Confirmed,
    Failed,
}

impl SenderState {
    pub fn as_str(self) -> &'static str {
        match self {
            SenderState::Idle => "idle",
            SenderState::Framing => "framing",
            SenderState::Sending => "sending",
            SenderState::AwaitingConfirmation => "awaiting_confirmation",
            SenderState::Confirmed => "confirmed",
            SenderState::Failed => "failed",
        }
    }
}

/// A hash reply from the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeldHash {
    Held([u8; HASH_SIZE]),
    Nothing,
}

pub struct Sender {
    target: SocketAddr,
    cipher: PacketCipher,
    config: Config,
    logger: Arc<dyn TransferLogger>,
}

impl Sender {
    pub fn new(target: SocketAddr, key: &[u8], config: Config) -> Result<Self, TransferError> {
        config.validate().map_err(TransferError::InvalidConfig)?;
        let cipher = PacketCipher::new(key)?;
        let logger: Arc<dyn TransferLogger> = Arc::new(TracingLogger::new(config.verbose_logging));
        Ok(Self {
            target,
            cipher,
            config,
            logger,
        })
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Transfer `data` under `name` and wait for confirmation.
    pub async fn send(
        &self,
        name: &str,
        data: impl Into<Bytes>,
    ) -> Result<TransferReport, TransferError> {
        self.send_with(name, data, SendOptions::default()).await
    }

    pub async fn send_with(
        &self,
        name: &str,
        data: impl Into<Bytes>,
        options: SendOptions,
    ) -> Result<TransferReport, TransferError> {
        let mut transfer = Transfer::new(self, Item::new(name, data));

        let result = match options.deadline.or(self.config.transfer_deadline) {
            Some(limit) => {
                match tokio::time::timeout(limit, transfer.run(options.check_existing)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransferError::Timeout(TimeoutCause::Deadline(limit))),
                }
            }
            None => transfer.run(options.check_existing).await,
        };

        if let Err(e) = &result {
            transfer.fail(e);
        }
        result
    }
}

/// State of one in-flight transfer.
struct Transfer<'a> {
    sender: &'a Sender,
    item: Item,
    session_id: u64,
    hash: [u8; HASH_SIZE],
    state: SenderState,
    started: Instant,
    packets: u32,
    retransmits: u64,
}

impl<'a> Transfer<'a> {
    fn new(sender: &'a Sender, item: Item) -> Self {
        Self {
            sender,
            item,
            session_id: rand::random(),
            hash: [0u8; HASH_SIZE],
            state: SenderState::Idle,
            started: Instant::now(),
            packets: 0,
            retransmits: 0,
        }
    }

    async fn run(&mut self, check_existing: bool) -> Result<TransferReport, TransferError> {
        self.transition(SenderState::Framing);
        validate_name(&self.item.name)?;
        self.hash = content_hash(&self.item.data);

        let transport =
            Transport::bind_ephemeral_for(self.sender.target, self.sender.config.socket_buffer_size)?;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        if check_existing && self.receiver_has_item(&transport, &mut buf).await? {
            return Ok(self.confirmed(true));
        }

        let packets = self.frame()?;

        self.transition(SenderState::Sending);
        self.deliver(&transport, &mut buf, &packets).await?;

        self.transition(SenderState::AwaitingConfirmation);
        self.confirm(&transport, &mut buf).await?;

        Ok(self.confirmed(false))
    }

    /// Existing-data check. The first reply decides; silence means "no".
    async fn receiver_has_item(
        &mut self,
        transport: &Transport,
        buf: &mut [u8],
    ) -> Result<bool, TransferError> {
        let attempts = self.sender.config.retry_count + 1;
        for attempt in 1..=attempts {
            self.query_hash(transport, attempt).await?;
            let until = Instant::now() + self.sender.config.reply_timeout;
            if let Some(reply) = self.await_hash(transport, buf, until).await? {
                let matched = reply == HeldHash::Held(self.hash);
                self.log_answer(reply, matched);
                return Ok(matched);
            }
        }
        tracing::debug!(
            session_id = %format!("{:016x}", self.session_id),
            "no answer to existing-data check, sending in full"
        );
        Ok(false)
    }

    /// Seal every chunk once. Retransmits reuse these exact bytes.
    fn frame(&mut self) -> Result<Vec<Bytes>, TransferError> {
        let limit = self.sender.config.packet_size_limit;
        let fragments = split(&self.item.data, self.sender.config.chunk_size)?;

        let mut packets = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let header = PacketHeader::new(
                PacketKind::Data,
                self.session_id,
                fragment.index,
                fragment.total,
                &self.item.name,
            );
            let encoded = self.sender.cipher.seal(header, &fragment.chunk)?.encode();
            if encoded.len() > limit {
                return Err(FrameError::PacketTooLarge {
                    size: encoded.len(),
                    limit,
                }
                .into());
            }
            packets.push(encoded);
        }

        self.packets = packets.len() as u32;
        self.log(TransferEvent::Framed {
            name: self.item.name.clone(),
            bytes: self.item.data.len(),
            packets: self.packets,
        });
        Ok(packets)
    }

    /// Send every packet, then resend the unacknowledged ones until all are
    /// acked or the retry budget is spent.
    async fn deliver(
        &mut self,
        transport: &Transport,
        buf: &mut [u8],
        packets: &[Bytes],
    ) -> Result<(), TransferError> {
        let mut acked = IndexBitfield::new(packets.len() as u32);

        for (index, packet) in packets.iter().enumerate() {
            self.send_data(transport, buf, &mut acked, index as u32, packet, false)
                .await?;
        }

        let retry_count = self.sender.config.retry_count;
        let mut round = 0u32;
        loop {
            let until = Instant::now() + self.sender.config.retry_interval_for(round);
            while !acked.is_complete() {
                match transport.recv_until(buf, until).await? {
                    Some((len, _)) => self.absorb_ack(&buf[..len], &mut acked),
                    None => break,
                }
            }
            if acked.is_complete() {
                return Ok(());
            }
            if round >= retry_count {
                return Err(TransferError::Timeout(TimeoutCause::RetriesExhausted {
                    phase: Phase::Sending,
                    attempts: round + 1,
                }));
            }

            round += 1;
            let missing = acked.missing();
            self.log(TransferEvent::RetransmitRound {
                round,
                missing: missing.len() as u32,
            });
            for index in missing {
                self.retransmits += 1;
                self.send_data(transport, buf, &mut acked, index, &packets[index as usize], true)
                    .await?;
            }
        }
    }

    async fn send_data(
        &mut self,
        transport: &Transport,
        buf: &mut [u8],
        acked: &mut IndexBitfield,
        index: u32,
        packet: &Bytes,
        retransmit: bool,
    ) -> Result<(), TransferError> {
        // An ack may have landed since the round started.
        if acked.get(index) {
            return Ok(());
        }
        transport.send_to(packet, self.sender.target).await?;
        self.log(TransferEvent::PacketSent { index, retransmit });

        let pacing = self.sender.config.send_interval;
        if !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }

        // Drain queued acks so a large item cannot overflow the receive buffer.
        while let Some((len, _)) = transport.try_recv_from(buf)? {
            self.absorb_ack(&buf[..len], acked);
        }
        Ok(())
    }

    fn absorb_ack(&self, datagram: &[u8], acked: &mut IndexBitfield) {
        let Ok(packet) = Packet::decode(datagram) else {
            return;
        };
        let header = &packet.header;
        if header.kind != PacketKind::Ack || header.session_id != self.session_id {
            return;
        }
        if self.sender.cipher.open(&packet).is_err() {
            return;
        }
        if acked.set(header.sequence) {
            self.log(TransferEvent::Acked {
                index: header.sequence,
            });
        }
    }

    /// Query the receiver's hash until it matches or the budget runs out.
    async fn confirm(&mut self, transport: &Transport, buf: &mut [u8]) -> Result<(), TransferError> {
        let attempts = self.sender.config.retry_count + 1;
        let mut mismatch: Option<[u8; HASH_SIZE]> = None;

        for attempt in 1..=attempts {
            self.query_hash(transport, attempt).await?;
            let until = Instant::now() + self.sender.config.reply_timeout;
            let Some(reply) = self.await_hash(transport, buf, until).await? else {
                continue;
            };

            let matched = reply == HeldHash::Held(self.hash);
            self.log_answer(reply, matched);
            if matched {
                return Ok(());
            }
            if let HeldHash::Held(actual) = reply {
                mismatch = Some(actual);
            }
            // Pace the next query instead of spinning on fast negative replies.
            tokio::time::sleep_until(until).await;
        }

        match mismatch {
            Some(actual) => Err(TransferError::HashMismatch {
                expected: hex::encode(self.hash),
                actual: hex::encode(actual),
            }),
            None => Err(TransferError::Timeout(TimeoutCause::RetriesExhausted {
                phase: Phase::Confirming,
                attempts,
            })),
        }
    }

    async fn query_hash(&self, transport: &Transport, attempt: u32) -> Result<(), TransferError> {
        let header = PacketHeader::new(
            PacketKind::HashRequest,
            self.session_id,
            0,
            self.packets,
            &self.item.name,
        );
        let packet = self.sender.cipher.seal(header, &[])?;
        transport
            .send_to(&packet.encode(), self.sender.target)
            .await?;
        self.log(TransferEvent::HashQueried { attempt });
        Ok(())
    }

    /// Wait for an authenticated hash reply for this session. Stale acks and
    /// anything unauthenticated are skipped.
    async fn await_hash(
        &self,
        transport: &Transport,
        buf: &mut [u8],
        until: Instant,
    ) -> io::Result<Option<HeldHash>> {
        while let Some((len, _)) = transport.recv_until(buf, until).await? {
            let Ok(packet) = Packet::decode(&buf[..len]) else {
                continue;
            };
            if packet.header.kind != PacketKind::HashReply
                || packet.header.session_id != self.session_id
            {
                continue;
            }
            let Ok(payload) = self.sender.cipher.open(&packet) else {
                continue;
            };
            if payload.is_empty() {
                return Ok(Some(HeldHash::Nothing));
            }
            if let Ok(hash) = <[u8; HASH_SIZE]>::try_from(payload.as_slice()) {
                return Ok(Some(HeldHash::Held(hash)));
            }
        }
        Ok(None)
    }

    fn log_answer(&self, reply: HeldHash, matched: bool) {
        let hash = match reply {
            HeldHash::Held(h) => Some(h),
            HeldHash::Nothing => None,
        };
        self.log(TransferEvent::HashAnswered { matched, hash });
    }

    fn confirmed(&mut self, short_circuited: bool) -> TransferReport {
        self.transition(SenderState::Confirmed);
        let elapsed = self.started.elapsed();
        self.log(TransferEvent::TransferConfirmed {
            name: self.item.name.clone(),
            short_circuited,
            retransmits: self.retransmits,
            duration_ms: elapsed.as_millis() as u64,
        });
        TransferReport {
            session_id: self.session_id,
            name: self.item.name.clone(),
            packets: self.packets,
            retransmits: self.retransmits,
            hash: self.hash,
            short_circuited,
            elapsed,
        }
    }

    fn fail(&mut self, error: &TransferError) {
        self.transition(SenderState::Failed);
        self.log(TransferEvent::TransferFailed {
            reason: error.to_string(),
        });
    }

    fn transition(&mut self, to: SenderState) {
        let from = self.state;
        self.state = to;
        self.log(TransferEvent::StateChanged {
            from: from.as_str(),
            to: to.as_str(),
        });
    }

    fn log(&self, event: TransferEvent) {
        self.sender.logger.log(TransferLog {
            component: COMPONENT,
            session_id: self.session_id,
            event,
        });
    }
}

/// Resolve `address:port` and run one transfer with a fresh `Sender`.
pub async fn send(
    name: &str,
    data: impl Into<Bytes>,
    address: &str,
    port: u16,
    key: &[u8],
    config: Config,
) -> Result<TransferReport, TransferError> {
    let target = tokio::net::lookup_host((address, port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve to an address", address),
            )
        })?;
    Sender::new(target, key, config)?.send(name, data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullLogger;

    const KEY: &[u8; 32] = b"aA2Xh41FiC4Wtj3e5b2LbytMdn6on7P0";

    fn quick() -> Config {
        Config {
            retry_count: 2,
            retry_interval: Duration::from_millis(20),
            reply_timeout: Duration::from_millis(20),
            ..Config::default()
        }
    }

    fn sender(target: SocketAddr, config: Config) -> Sender {
        Sender::new(target, KEY, config)
            .unwrap()
            .with_logger(Arc::new(NullLogger))
    }

    #[test]
    fn state_names() {
        assert_eq!(SenderState::AwaitingConfirmation.as_str(), "awaiting_confirmation");
        assert_eq!(SenderState::Idle.as_str(), "idle");
    }

    #[test]
    fn rejects_bad_key_and_config() {
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            Sender::new(target, &[0u8; 16], Config::default()),
            Err(TransferError::Crypto(_))
        ));
        let config = Config {
            retry_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(
            Sender::new(target, KEY, config),
            Err(TransferError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn invalid_name_fails_before_sending() {
        let s = sender("127.0.0.1:9".parse().unwrap(), quick());
        let err = s.send("", "data").await.unwrap_err();
        assert!(matches!(err, TransferError::Frame(FrameError::InvalidName(_))));
    }

    #[tokio::test]
    async fn oversize_packet_is_rejected() {
        let config = Config {
            chunk_size: 1000,
            packet_size_limit: 1100,
            ..quick()
        };
        let s = sender("127.0.0.1:9".parse().unwrap(), config);
        let name = "n".repeat(200);
        let err = s.send(&name, vec![1u8; 1000]).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Frame(FrameError::PacketTooLarge { limit: 1100, .. })
        ));
    }

    #[tokio::test]
    async fn silent_peer_times_out_in_sending() {
        // Bound but never read: nothing is ever acknowledged.
        let silent = Transport::bind("127.0.0.1:0".parse().unwrap(), 64 * 1024).unwrap();
        let s = sender(silent.local_addr().unwrap(), quick());
        let err = s.send("x", "payload").await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Timeout(TimeoutCause::RetriesExhausted {
                phase: Phase::Sending,
                attempts: 3
            })
        ));
    }

    #[tokio::test]
    async fn deadline_cuts_transfer_short() {
        let silent = Transport::bind("127.0.0.1:0".parse().unwrap(), 64 * 1024).unwrap();
        let config = Config {
            retry_interval: Duration::from_secs(1),
            ..quick()
        };
        let s = sender(silent.local_addr().unwrap(), config);
        let options = SendOptions {
            deadline: Some(Duration::from_millis(50)),
            ..SendOptions::default()
        };
        let err = s.send_with("x", "payload", options).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Timeout(TimeoutCause::Deadline(d)) if d == Duration::from_millis(50)
        ));
    }
}
