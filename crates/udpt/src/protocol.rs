/// UDP packet format, version 1.
///
/// ```text
/// [0..2]    Magic "UT"
/// [2]       Version (1)
/// [3]       Kind: 1 data, 2 ack, 3 hash request, 4 hash reply
/// [4..12]   Session ID (u64 BE)
/// [12..16]  Sequence index (u32 BE)
/// [16..20]  Total count (u32 BE)
/// [20..22]  Name length (u16 BE, 1..=255)
/// [22..]    Name (UTF-8)
/// [..]      Sealed payload: nonce(12) + ciphertext + GCM tag(16)
/// ```
///
/// The header bytes (magic through name) are the AEAD associated data, so a
/// packet whose header was altered in flight fails authentication.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

pub const MAGIC: [u8; 2] = *b"UT";
pub const VERSION: u8 = 1;

/// Fixed header size, not counting the name.
pub const HEADER_SIZE: usize = 22;

pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Sealed payload overhead: 12-byte nonce + 16-byte GCM tag.
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

pub const MAX_NAME_LEN: usize = 255;

/// Largest UDP payload over IPv4 (65535 - 20 IP - 8 UDP).
pub const MAX_DATAGRAM: usize = 65_507;

/// SHA-256 confirmation hash length.
pub const HASH_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// One chunk of an item. Sender → receiver.
    Data = 1,
    /// Receipt of one data packet. Receiver → sender.
    Ack = 2,
    /// "What hash do you hold for this name?" Sender → receiver.
    HashRequest = 3,
    /// 32-byte hash, or empty when the receiver holds nothing. Receiver → sender.
    HashReply = 4,
}

impl PacketKind {
    fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(PacketKind::Data),
            2 => Ok(PacketKind::Ack),
            3 => Ok(PacketKind::HashRequest),
            4 => Ok(PacketKind::HashReply),
            other => Err(FrameError::UnknownKind(other)),
        }
    }

    /// Data packets and acks address one index of a session.
    fn is_indexed(self) -> bool {
        matches!(self, PacketKind::Data | PacketKind::Ack)
    }
}

/// Parsed packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub session_id: u64,
    pub sequence: u32,
    pub total: u32,
    pub name: String,
}

impl PacketHeader {
    pub fn new(kind: PacketKind, session_id: u64, sequence: u32, total: u32, name: &str) -> Self {
        Self {
            kind,
            session_id,
            sequence,
            total,
            name: name.to_owned(),
        }
    }

    /// Header for an answer to this packet: same session, index and name.
    pub fn reply(&self, kind: PacketKind) -> Self {
        Self {
            kind,
            session_id: self.session_id,
            sequence: self.sequence,
            total: self.total,
            name: self.name.clone(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.name.len()
    }

    /// Append the wire form of this header to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u64(self.session_id);
        buf.put_u32(self.sequence);
        buf.put_u32(self.total);
        buf.put_u16(self.name.len() as u16);
        buf.put_slice(self.name.as_bytes());
    }

    /// Wire form of the header alone (used as associated data).
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Parse a header from the front of `buf`. Returns the header and its length.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::Malformed("shorter than header"));
        }
        if buf[0..2] != MAGIC {
            return Err(FrameError::Malformed("bad magic"));
        }
        if buf[2] != VERSION {
            return Err(FrameError::UnsupportedVersion(buf[2]));
        }
        let kind = PacketKind::from_u8(buf[3])?;
        let session_id = u64::from_be_bytes([
            buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
        ]);
        let sequence = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let total = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let name_len = u16::from_be_bytes([buf[20], buf[21]]) as usize;

        let end = HEADER_SIZE + name_len;
        if buf.len() < end {
            return Err(FrameError::Malformed("name truncated"));
        }
        let name = std::str::from_utf8(&buf[HEADER_SIZE..end])
            .map_err(|_| FrameError::InvalidName("not valid UTF-8"))?;
        validate_name(name)?;

        if kind.is_indexed() && sequence >= total {
            return Err(FrameError::Malformed("sequence index outside total count"));
        }

        Ok((
            Self {
                kind,
                session_id,
                sequence,
                total,
                name: name.to_owned(),
            },
            end,
        ))
    }
}

/// Check an item name against the wire constraints.
pub fn validate_name(name: &str) -> Result<(), FrameError> {
    if name.is_empty() {
        return Err(FrameError::InvalidName("empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FrameError::InvalidName("longer than 255 bytes"));
    }
    Ok(())
}

/// A complete packet: header plus sealed payload.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub sealed: Bytes,
}

impl Packet {
    pub fn encoded_len(&self) -> usize {
        self.header.encoded_len() + self.sealed.len()
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.write_to(&mut buf);
        buf.put_slice(&self.sealed);
        buf.freeze()
    }

    /// Parse from wire format. The payload is not opened here.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() > MAX_DATAGRAM {
            return Err(FrameError::PacketTooLarge {
                size: buf.len(),
                limit: MAX_DATAGRAM,
            });
        }
        let (header, header_len) = PacketHeader::parse(buf)?;
        Ok(Self {
            header,
            sealed: Bytes::copy_from_slice(&buf[header_len..]),
        })
    }
}
