/// Transfer configuration shared by sender and receiver.
///
/// A `Config` is an immutable value handed to `Sender::new` / `Receiver::bind`.
/// `Config::from_env` overlays `UDPT_*` variables on the defaults.

use std::time::Duration;

use crate::protocol::{ENCRYPTION_OVERHEAD, HEADER_SIZE, MAX_DATAGRAM, MAX_NAME_LEN};

/// Default plaintext bytes per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Default upper bound for one encoded datagram.
pub const DEFAULT_PACKET_SIZE_LIMIT: usize = 1450;

/// Default OS socket buffer size (4 MB).
pub const DEFAULT_SOCKET_BUFFER: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Emit per-packet events (sent, acked, stored) in addition to lifecycle events.
    pub verbose_logging: bool,
    /// Plaintext bytes carried by one data packet.
    pub chunk_size: usize,
    /// Largest datagram the sender may produce (header + name + sealed chunk).
    pub packet_size_limit: usize,
    /// Resend rounds (sending) and extra hash queries (confirmation) before giving up.
    pub retry_count: u32,
    /// Wait for acks before the first resend round.
    pub retry_interval: Duration,
    /// Growth factor of the resend interval per round. 1.0 keeps it fixed.
    pub backoff_multiplier: f64,
    /// Ceiling for the resend interval.
    pub max_retry_interval: Duration,
    /// Wait for one hash reply.
    pub reply_timeout: Duration,
    /// Pause between consecutive data packets. Zero disables pacing.
    pub send_interval: Duration,
    /// Hard limit for a whole transfer.
    pub transfer_deadline: Option<Duration>,
    /// Receiver: drop sessions idle for longer than this.
    pub session_timeout: Duration,
    /// Receiver: how often the session table is swept.
    pub sweep_interval: Duration,
    /// Receiver: how long confirmation hashes of completed items are kept.
    pub hash_retention: Duration,
    /// Receiver: largest item it is willing to reassemble.
    pub max_item_size: usize,
    /// Receiver: concurrent in-progress sessions.
    pub max_sessions: usize,
    /// SO_RCVBUF / SO_SNDBUF requested for every socket.
    pub socket_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose_logging: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            packet_size_limit: DEFAULT_PACKET_SIZE_LIMIT,
            retry_count: 10,
            retry_interval: Duration::from_millis(200),
            backoff_multiplier: 1.0,
            max_retry_interval: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(1),
            send_interval: Duration::ZERO,
            transfer_deadline: None,
            session_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            hash_retention: Duration::from_secs(600),
            max_item_size: 64 * 1024 * 1024,
            max_sessions: 1024,
            socket_buffer_size: DEFAULT_SOCKET_BUFFER,
        }
    }
}

impl Config {
    /// Defaults with verbose per-packet logging.
    pub fn debug() -> Self {
        Self {
            verbose_logging: true,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `UDPT_*` environment variables.
    ///
    /// Durations are given in milliseconds. Unparseable values fall back to
    /// the default.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            verbose_logging: env_parse("UDPT_VERBOSE").unwrap_or(base.verbose_logging),
            chunk_size: env_parse("UDPT_CHUNK_SIZE").unwrap_or(base.chunk_size),
            packet_size_limit: env_parse("UDPT_PACKET_SIZE_LIMIT")
                .unwrap_or(base.packet_size_limit),
            retry_count: env_parse("UDPT_RETRY_COUNT").unwrap_or(base.retry_count),
            retry_interval: env_millis("UDPT_RETRY_INTERVAL_MS").unwrap_or(base.retry_interval),
            backoff_multiplier: env_parse("UDPT_BACKOFF_MULTIPLIER")
                .unwrap_or(base.backoff_multiplier),
            max_retry_interval: env_millis("UDPT_MAX_RETRY_INTERVAL_MS")
                .unwrap_or(base.max_retry_interval),
            reply_timeout: env_millis("UDPT_REPLY_TIMEOUT_MS").unwrap_or(base.reply_timeout),
            send_interval: env_millis("UDPT_SEND_INTERVAL_MS").unwrap_or(base.send_interval),
            transfer_deadline: env_millis("UDPT_TRANSFER_DEADLINE_MS").or(base.transfer_deadline),
            session_timeout: env_millis("UDPT_SESSION_TIMEOUT_MS").unwrap_or(base.session_timeout),
            sweep_interval: env_millis("UDPT_SWEEP_INTERVAL_MS").unwrap_or(base.sweep_interval),
            hash_retention: env_millis("UDPT_HASH_RETENTION_MS").unwrap_or(base.hash_retention),
            max_item_size: env_parse("UDPT_MAX_ITEM_SIZE").unwrap_or(base.max_item_size),
            max_sessions: env_parse("UDPT_MAX_SESSIONS").unwrap_or(base.max_sessions),
            socket_buffer_size: env_parse("UDPT_SOCKET_BUFFER_SIZE")
                .unwrap_or(base.socket_buffer_size),
        }
    }

    /// Reject values the engines cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be at least 1".into());
        }
        if self.packet_size_limit > MAX_DATAGRAM {
            return Err(format!(
                "packet_size_limit {} exceeds the UDP maximum of {}",
                self.packet_size_limit, MAX_DATAGRAM
            ));
        }
        let smallest = HEADER_SIZE + 1 + ENCRYPTION_OVERHEAD + self.chunk_size;
        if smallest > self.packet_size_limit {
            return Err(format!(
                "chunk_size {} does not fit in packet_size_limit {} (needs {} bytes with a 1-byte name)",
                self.chunk_size, self.packet_size_limit, smallest
            ));
        }
        if self.retry_interval.is_zero() || self.reply_timeout.is_zero() {
            return Err("retry_interval and reply_timeout must be non-zero".into());
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err("backoff_multiplier must be a finite value >= 1.0".into());
        }
        if self.sweep_interval.is_zero() || self.session_timeout.is_zero() {
            return Err("sweep_interval and session_timeout must be non-zero".into());
        }
        if self.max_sessions == 0 {
            return Err("max_sessions must be at least 1".into());
        }
        Ok(())
    }

    /// Longest item name that still fits a full chunk into `packet_size_limit`.
    pub fn max_name_len(&self) -> usize {
        self.packet_size_limit
            .saturating_sub(HEADER_SIZE + ENCRYPTION_OVERHEAD + self.chunk_size)
            .min(MAX_NAME_LEN)
    }

    /// Resend interval for round `round` (0-based), with backoff and ceiling applied.
    pub fn retry_interval_for(&self, round: u32) -> Duration {
        let ceiling = self.max_retry_interval.max(self.retry_interval);
        let factor = self.backoff_multiplier.powi(round.min(64) as i32);
        let nanos = self.retry_interval.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= ceiling.as_nanos() as f64 {
            return ceiling;
        }
        Duration::from_nanos(nanos as u64)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
