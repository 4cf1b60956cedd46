//! # relaycopy packet codec
//!
//! Authenticated, size-hiding, streaming encryption of packets.
//!
//! ## Overview
//!
//! A packet is a plaintext [`Packet`] header followed by an arbitrary payload.
//! On the wire it is wrapped in an [`EncryptedPacket`] envelope naming the
//! sender, the recipient and a fresh ephemeral X25519 key, signed with the
//! sender's Ed25519 key. The header and payload follow as a chain of
//! ChaCha20-Poly1305 blocks, then an encrypted size record, then padding.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use relaycopy_core::NodeOur;
//! use relaycopy_packet::{decode_packet, encode_packet, EncodeOptions, Packet, PacketType};
//!
//! let alice = NodeOur::generate();
//! let bob = NodeOur::generate();
//! let pkt = Packet::new(PacketType::File, 64, "notes.txt").unwrap();
//!
//! let mut wire = Vec::new();
//! encode_packet(&alice, bob.their(), &pkt, &EncodeOptions::default(), &b"hello"[..], &mut wire).unwrap();
//!
//! let peers = HashMap::from([(alice.id(), alice.their().clone())]);
//! let mut plain = Vec::new();
//! decode_packet(&bob, &peers, &wire[..], &mut plain, true, None).unwrap();
//! ```

pub mod codec;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod packet;

pub use codec::{decode_packet, encode_packet, Decoded, EncodeOptions, Encoded, PKT_OVERHEAD};
pub use crypto::{EphemeralKeyPair, SharedKey, BLOCK_SIZE, TAG_SIZE};
pub use envelope::{EncryptedPacket, ENVELOPE_LEN, ENVELOPE_MAGIC};
pub use error::{PacketError, Result};
pub use packet::{Packet, PacketType, MAX_PATH_LEN, PACKET_HEADER_LEN};
