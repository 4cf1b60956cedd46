//! Encrypted packet envelope.
//!
//! The envelope precedes the ciphertext stream and binds it to its sender,
//! recipient and ephemeral key. Its fixed layout is
//! `magic(8) nice(1) sender(32) recipient(32) ephemeral(32) signature(64)`.
//! The signature covers everything before it.

use bytes::{Buf, BufMut};
use std::io::Read;

use relaycopy_core::{Ed25519Signature, NodeId};

use crate::error::{PacketError, Result};

/// Magic of the current envelope format.
pub const ENVELOPE_MAGIC: [u8; 8] = *b"RCENC\x00\x00\x03";

/// Envelope magics of earlier format versions.
const OLD_MAGICS: [([u8; 8], &str); 2] = [
    (*b"RCENC\x00\x00\x01", "v1"),
    (*b"RCENC\x00\x00\x02", "v2"),
];

/// Length of the signed portion.
pub const TBS_LEN: usize = 8 + 1 + 32 + 32 + 32;

/// Full envelope length.
pub const ENVELOPE_LEN: usize = TBS_LEN + 64;

/// Check an envelope magic against the version table.
pub fn check_magic(magic: &[u8; 8]) -> Result<()> {
    if *magic == ENVELOPE_MAGIC {
        return Ok(());
    }
    match OLD_MAGICS.iter().find(|(old, _)| old == magic) {
        Some((_, version)) => Err(PacketError::TooOld {
            magic: version.to_string(),
        }),
        None => Err(PacketError::BadMagic),
    }
}

/// Envelope of an encrypted packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPacket {
    pub nice: u8,
    pub sender: NodeId,
    pub recipient: NodeId,
    pub exch_pub: [u8; 32],
    pub sig: Ed25519Signature,
}

impl EncryptedPacket {
    /// The to-be-signed prefix.
    pub fn tbs_bytes(&self) -> [u8; TBS_LEN] {
        let mut out = [0u8; TBS_LEN];
        let mut buf = &mut out[..];
        buf.put_slice(&ENVELOPE_MAGIC);
        buf.put_u8(self.nice);
        buf.put_slice(self.sender.as_bytes());
        buf.put_slice(self.recipient.as_bytes());
        buf.put_slice(&self.exch_pub);
        out
    }

    /// Associated data binding every ciphertext block to this envelope.
    pub fn associated_data(&self) -> [u8; 32] {
        *blake3::hash(&self.tbs_bytes()).as_bytes()
    }

    /// Fixed-size encoding.
    pub fn to_bytes(&self) -> [u8; ENVELOPE_LEN] {
        let mut out = [0u8; ENVELOPE_LEN];
        out[..TBS_LEN].copy_from_slice(&self.tbs_bytes());
        out[TBS_LEN..].copy_from_slice(self.sig.as_bytes());
        out
    }

    /// Parse an envelope, checking its magic.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENVELOPE_LEN {
            return Err(PacketError::Malformed(format!(
                "envelope needs {} bytes, got {}",
                ENVELOPE_LEN,
                bytes.len()
            )));
        }
        let mut buf = &bytes[..ENVELOPE_LEN];
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        check_magic(&magic)?;

        let nice = buf.get_u8();
        let mut sender = [0u8; 32];
        buf.copy_to_slice(&mut sender);
        let mut recipient = [0u8; 32];
        buf.copy_to_slice(&mut recipient);
        let mut exch_pub = [0u8; 32];
        buf.copy_to_slice(&mut exch_pub);
        let mut sig = [0u8; 64];
        buf.copy_to_slice(&mut sig);

        Ok(Self {
            nice,
            sender: NodeId(sender),
            recipient: NodeId(recipient),
            exch_pub,
            sig: Ed25519Signature(sig),
        })
    }

    /// Read and parse an envelope from the start of a stream.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = [0u8; ENVELOPE_LEN];
        reader.read_exact(&mut bytes).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                PacketError::Malformed("truncated envelope".to_string())
            }
            _ => PacketError::Io(e),
        })?;
        Self::from_bytes(&bytes)
    }

    /// Niceness of an encoded envelope without parsing the rest.
    pub fn peek_nice(bytes: &[u8]) -> Result<u8> {
        if bytes.len() < 9 {
            return Err(PacketError::Malformed("truncated envelope".to_string()));
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[..8]);
        check_magic(&magic)?;
        Ok(bytes[8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedPacket {
        EncryptedPacket {
            nice: 42,
            sender: NodeId([1; 32]),
            recipient: NodeId([2; 32]),
            exch_pub: [3; 32],
            sig: Ed25519Signature([4; 64]),
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = sample();
        let bytes = env.to_bytes();
        assert_eq!(bytes.len(), ENVELOPE_LEN);
        assert_eq!(EncryptedPacket::from_bytes(&bytes).unwrap(), env);
        assert_eq!(EncryptedPacket::read_from(&bytes[..]).unwrap(), env);
    }

    #[test]
    fn test_field_order() {
        let bytes = sample().to_bytes();
        assert_eq!(&bytes[..8], &ENVELOPE_MAGIC);
        assert_eq!(bytes[8], 42);
        assert_eq!(&bytes[9..41], &[1; 32]);
        assert_eq!(&bytes[41..73], &[2; 32]);
        assert_eq!(&bytes[73..105], &[3; 32]);
        assert_eq!(&bytes[105..], &[4; 64][..]);
    }

    #[test]
    fn test_old_magic_is_too_old() {
        let mut bytes = sample().to_bytes();
        bytes[7] = 2;
        assert!(matches!(
            EncryptedPacket::from_bytes(&bytes),
            Err(PacketError::TooOld { .. })
        ));
        bytes[7] = 9;
        assert!(matches!(
            EncryptedPacket::from_bytes(&bytes),
            Err(PacketError::BadMagic)
        ));
    }

    #[test]
    fn test_peek_nice() {
        let bytes = sample().to_bytes();
        assert_eq!(EncryptedPacket::peek_nice(&bytes).unwrap(), 42);
        assert!(EncryptedPacket::peek_nice(&bytes[..5]).is_err());
    }

    #[test]
    fn test_truncated_read() {
        let bytes = sample().to_bytes();
        assert!(matches!(
            EncryptedPacket::read_from(&bytes[..100]),
            Err(PacketError::Malformed(_))
        ));
    }
}
