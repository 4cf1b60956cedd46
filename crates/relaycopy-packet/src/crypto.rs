//! Key agreement and block encryption for packets.
//!
//! The X25519 shared secret between the sender's ephemeral key and the
//! recipient's exchange key is split by BLAKE3 key derivation into three
//! keys: one for payload blocks, one for the size record, one for padding.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::{PacketError, Result};

/// AEAD block size for packet payloads.
pub const BLOCK_SIZE: usize = 128 * 1024;

/// Poly1305 tag length.
pub const TAG_SIZE: usize = 16;

const CTX_FULL: &str = "relaycopy packet v3 full";
const CTX_SIZE: &str = "relaycopy packet v3 size";
const CTX_PAD: &str = "relaycopy packet v3 pad";

/// Shared secret for one envelope, remembered with the ephemeral key it
/// came from so it can be reused for the same envelope.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey {
    ephemeral: [u8; 32],
    secret: [u8; 32],
}

impl SharedKey {
    /// Recipient side: our static exchange secret with their ephemeral key.
    pub fn agree(our: &StaticSecret, ephemeral: &[u8; 32]) -> Self {
        let shared = our.diffie_hellman(&PublicKey::from(*ephemeral));
        Self {
            ephemeral: *ephemeral,
            secret: *shared.as_bytes(),
        }
    }

    /// Ephemeral public key this secret belongs to.
    pub fn ephemeral(&self) -> &[u8; 32] {
        &self.ephemeral
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Derive the three per-packet keys.
    pub fn packet_keys(&self) -> Result<PacketKeys> {
        Ok(PacketKeys {
            full: BlockKey::new(&blake3::derive_key(CTX_FULL, &self.secret))?,
            size: BlockKey::new(&blake3::derive_key(CTX_SIZE, &self.secret))?,
            pad: blake3::derive_key(CTX_PAD, &self.secret),
        })
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedKey(eph={})", &hex::encode(self.ephemeral)[..16])
    }
}

/// Ephemeral key pair for one-time key agreement.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: [u8; 32],
}

impl EphemeralKeyPair {
    /// Generate a new ephemeral key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Perform key agreement with the recipient's exchange key.
    ///
    /// Consumes the ephemeral secret (can only be used once).
    pub fn diffie_hellman(self, peer_public: &[u8; 32]) -> SharedKey {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        SharedKey {
            ephemeral: self.public,
            secret: *shared.as_bytes(),
        }
    }
}

/// Keys derived for a single packet.
pub struct PacketKeys {
    pub full: BlockKey,
    pub size: BlockKey,
    pub pad: [u8; 32],
}

impl PacketKeys {
    /// Pseudorandom padding stream.
    pub fn pad_stream(&self) -> blake3::OutputReader {
        blake3::Hasher::new_keyed(&self.pad).finalize_xof()
    }
}

/// ChaCha20-Poly1305 key sealing counter-numbered blocks.
pub struct BlockKey(ChaCha20Poly1305);

impl BlockKey {
    fn new(key: &[u8; 32]) -> Result<Self> {
        ChaCha20Poly1305::new_from_slice(key)
            .map(Self)
            .map_err(|e| PacketError::Encrypt(e.to_string()))
    }

    /// Encrypt block number `ctr`.
    pub fn seal(&self, ctr: u64, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = block_nonce(ctr);
        self.0
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: ad })
            .map_err(|e| PacketError::Encrypt(e.to_string()))
    }

    /// Decrypt block number `ctr`.
    pub fn open(&self, ctr: u64, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = block_nonce(ctr);
        self.0
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: ad })
            .map_err(|_| PacketError::Decrypt)
    }
}

/// Zero nonce with a big-endian counter in the trailing eight bytes.
fn block_nonce(ctr: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&ctr.to_be_bytes());
    nonce
}
