//! Encrypted, hash-confirmed transfer of named items over UDP.
//!
//! A `Sender` splits an item into chunks, seals each chunk with AES-256-GCM
//! under a pre-shared 32-byte key and sends it to a `Receiver`, resending
//! until every packet is acknowledged. The transfer only counts as done once
//! the receiver reports the same SHA-256 of the reassembled item.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! let key = b"aA2Xh41FiC4Wtj3e5b2LbytMdn6on7P0";
//! let report = udpt::send("demo_data", "Hello World!", "127.0.0.1", 1234, key, udpt::Config::default()).await?;
//! println!("confirmed {} ({})", report.name, report.hash_hex());
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod config;
pub mod crypto;
pub mod error;
pub mod framer;
pub mod logging;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use crypto::{KEY_SIZE, PacketCipher, content_hash};
pub use error::{CryptoError, FrameError, Phase, ReceiverError, TimeoutCause, TransferError};
pub use framer::{Item, reassemble, split};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use receiver::{ItemHandler, Receiver, ReceiverHandle, run_receiver};
pub use sender::{SendOptions, Sender, SenderState, TransferReport, send};
pub use stats::{ReceiverStats, ReceiverStatsSnapshot};
