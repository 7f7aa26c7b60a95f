/// AES-256-GCM sealing of packet payloads.
///
/// Key derivation: HKDF-SHA256(transfer_key, no salt) expanded twice
///   info = "udpt v1 data"    → key for data packets
///   info = "udpt v1 control" → key for acks and hash queries/replies
///
/// Data packet nonce (deterministic, so retransmits are byte-identical):
///   nonce[0..8]  = session_id (big-endian)
///   nonce[8..12] = sequence index (big-endian)
///
/// Control packets use a random nonce under their own key, so they can never
/// collide with a data nonce.
///
/// Sealed payload: nonce(12) + ciphertext + GCM tag(16). The encoded packet
/// header is the associated data.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::{BufMut, BytesMut};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, IntegrityFailure};
use crate::protocol::{
    ENCRYPTION_OVERHEAD, HASH_SIZE, NONCE_SIZE, Packet, PacketHeader, PacketKind,
};

/// Transfer key length.
pub const KEY_SIZE: usize = 32;

const DATA_INFO: &[u8] = b"udpt v1 data";
const CONTROL_INFO: &[u8] = b"udpt v1 control";

/// Seals and opens packets with keys derived from the shared transfer key.
#[derive(Clone)]
pub struct PacketCipher {
    data: Aes256Gcm,
    control: Aes256Gcm,
}

impl PacketCipher {
    /// Validate the transfer key and derive the packet keys.
    pub fn new(transfer_key: &[u8]) -> Result<Self, CryptoError> {
        if transfer_key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: transfer_key.len(),
            });
        }
        let hk = Hkdf::<Sha256>::new(None, transfer_key);
        Ok(Self {
            data: derive_cipher(&hk, DATA_INFO)?,
            control: derive_cipher(&hk, CONTROL_INFO)?,
        })
    }

    fn data_nonce(session_id: u64, sequence: u32) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0..8].copy_from_slice(&session_id.to_be_bytes());
        nonce[8..12].copy_from_slice(&sequence.to_be_bytes());
        nonce
    }

    /// Encrypt `plaintext` under `header` and return the finished packet.
    pub fn seal(&self, header: PacketHeader, plaintext: &[u8]) -> Result<Packet, CryptoError> {
        let aad = header.to_bytes();
        let (cipher, nonce) = match header.kind {
            PacketKind::Data => (
                &self.data,
                Self::data_nonce(header.session_id, header.sequence),
            ),
            _ => {
                let random = Aes256Gcm::generate_nonce(&mut OsRng);
                let mut nonce = [0u8; NONCE_SIZE];
                nonce.copy_from_slice(&random);
                (&self.control, nonce)
            }
        };

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Seal)?;

        let mut sealed = BytesMut::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.put_slice(&nonce);
        sealed.put_slice(&ciphertext);
        Ok(Packet {
            header,
            sealed: sealed.freeze(),
        })
    }

    /// Authenticate and decrypt a packet. Fails closed on any mismatch.
    pub fn open(&self, packet: &Packet) -> Result<Vec<u8>, CryptoError> {
        let sealed = &packet.sealed;
        if sealed.len() < ENCRYPTION_OVERHEAD {
            return Err(CryptoError::Integrity(IntegrityFailure::TooShort));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        let cipher = match packet.header.kind {
            PacketKind::Data => {
                let expected =
                    Self::data_nonce(packet.header.session_id, packet.header.sequence);
                if nonce != &expected[..] {
                    return Err(CryptoError::Integrity(IntegrityFailure::NonceMismatch));
                }
                &self.data
            }
            _ => &self.control,
        };

        let aad = packet.header.to_bytes();
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Integrity(IntegrityFailure::AuthFailed))
    }
}

fn derive_cipher(hk: &Hkdf<Sha256>, info: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    let mut key = [0u8; KEY_SIZE];
    hk.expand(info, &mut key).map_err(|_| CryptoError::Seal)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Seal);
    key.fill(0);
    cipher
}

/// SHA-256 over a complete item: the confirmation hash.
pub fn content_hash(data: &[u8]) -> [u8; HASH_SIZE] {
    Sha256::digest(data).into()
}
