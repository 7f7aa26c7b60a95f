/// Error types for the codec, the sender and the receiver.
///
/// Per-packet faults (`CryptoError::Integrity`, most `FrameError`s) are
/// absorbed by the receiver loop. Only whole-transfer outcomes reach the
/// sender's caller, and only fatal socket errors leave the receiver.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Why a sealed payload was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityFailure {
    TooShort,
    NonceMismatch,
    AuthFailed,
}

impl std::fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityFailure::TooShort => write!(f, "sealed payload too short"),
            IntegrityFailure::NonceMismatch => {
                write!(f, "nonce does not match session/sequence")
            }
            IntegrityFailure::AuthFailed => write!(f, "authentication tag mismatch"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("transfer key must be {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("integrity check failed: {0}")]
    Integrity(IntegrityFailure),

    #[error("encryption failed")]
    Seal,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown packet kind {0}")]
    UnknownKind(u8),

    #[error("invalid item name: {0}")]
    InvalidName(&'static str),

    #[error("chunk size must be at least 1 byte")]
    ChunkTooSmall,

    #[error("item of {size} bytes needs more than {max} chunks")]
    TooManyChunks { size: usize, max: u32 },

    #[error("encoded packet of {size} bytes exceeds the {limit} byte limit")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("incomplete transfer: {missing} of {total} chunks missing")]
    Incomplete { missing: usize, total: u32 },
}

/// Phase of a transfer that ran out of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ExistingCheck,
    Sending,
    Confirming,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::ExistingCheck => write!(f, "existing-data check"),
            Phase::Sending => write!(f, "sending"),
            Phase::Confirming => write!(f, "confirmation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    /// The retry budget of a phase ran out.
    RetriesExhausted { phase: Phase, attempts: u32 },
    /// The caller's deadline elapsed.
    Deadline(Duration),
}

impl std::fmt::Display for TimeoutCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutCause::RetriesExhausted { phase, attempts } => {
                write!(f, "{} gave up after {} attempts", phase, attempts)
            }
            TimeoutCause::Deadline(limit) => {
                write!(f, "deadline of {} ms elapsed", limit.as_millis())
            }
        }
    }
}

/// Failure of one outbound transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transfer timed out: {0}")]
    Timeout(TimeoutCause),

    #[error("confirmation hash mismatch: expected {expected}, receiver has {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl TransferError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout(_))
    }
}

/// Fatal receiver failure.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}
