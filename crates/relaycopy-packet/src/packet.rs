//! Plaintext packet header.
//!
//! Every encrypted stream starts with this fixed-size header, followed by the
//! caller's payload. The header travels only inside the encryption.

use bytes::{Buf, BufMut};

use crate::error::{PacketError, Result};

/// Magic of the current plaintext header format.
pub const PACKET_MAGIC: [u8; 8] = *b"RCPKT\x00\x00\x03";

/// Longest path a header can carry.
pub const MAX_PATH_LEN: usize = 255;

/// Encoded header size: magic, type, nice, path length, path.
pub const PACKET_HEADER_LEN: usize = 8 + 1 + 1 + 1 + MAX_PATH_LEN;

/// What the payload of a packet is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// File transmission.
    File = 0,
    /// File request.
    Freq = 1,
    /// Command execution with compressed body.
    Exec = 2,
    /// Transit packet to be relayed further.
    Trns = 3,
    /// Command execution with uncompressed body.
    ExecFat = 4,
    /// Broadcast area message.
    Area = 5,
    /// Delivery acknowledgement.
    Ack = 6,
}

impl PacketType {
    /// Convert to u8.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::File),
            1 => Some(Self::Freq),
            2 => Some(Self::Exec),
            3 => Some(Self::Trns),
            4 => Some(Self::ExecFat),
            5 => Some(Self::Area),
            6 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// Plaintext packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub nice: u8,
    pub path: Vec<u8>,
}

impl Packet {
    /// Create a header; the path may be at most [`MAX_PATH_LEN`] bytes.
    pub fn new(kind: PacketType, nice: u8, path: impl Into<Vec<u8>>) -> Result<Self> {
        let path = path.into();
        if path.len() > MAX_PATH_LEN {
            return Err(PacketError::Malformed(format!(
                "path of {} bytes exceeds {}",
                path.len(),
                MAX_PATH_LEN
            )));
        }
        Ok(Self { kind, nice, path })
    }

    /// Fixed-size encoding; unused path bytes are zero.
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut out = [0u8; PACKET_HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_slice(&PACKET_MAGIC);
        buf.put_u8(self.kind.to_u8());
        buf.put_u8(self.nice);
        buf.put_u8(self.path.len() as u8);
        buf.put_slice(&self.path);
        out
    }

    /// Parse a header from the first [`PACKET_HEADER_LEN`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PACKET_HEADER_LEN {
            return Err(PacketError::Malformed(format!(
                "header needs {} bytes, got {}",
                PACKET_HEADER_LEN,
                bytes.len()
            )));
        }
        let mut buf = &bytes[..PACKET_HEADER_LEN];
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != PACKET_MAGIC {
            return Err(PacketError::BadMagic);
        }
        let kind_byte = buf.get_u8();
        let kind = PacketType::from_u8(kind_byte)
            .ok_or_else(|| PacketError::Malformed(format!("unknown packet type {}", kind_byte)))?;
        let nice = buf.get_u8();
        let path_len = buf.get_u8() as usize;
        let path = buf[..path_len].to_vec();
        Ok(Self { kind, nice, path })
    }

    /// Split decoded plaintext into its header and payload.
    pub fn split_plaintext(plaintext: &[u8]) -> Result<(Self, &[u8])> {
        let packet = Self::from_bytes(plaintext)?;
        Ok((packet, &plaintext[PACKET_HEADER_LEN..]))
    }
}
