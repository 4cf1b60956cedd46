//! Node identities.
//!
//! A node holds three keypairs: Ed25519 for signing envelopes, X25519 for
//! packet key agreement, and a separate X25519 static key for the Noise
//! handshake. Its [`NodeId`] is always the Blake3 hash of the signing key.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{CoreError, Result};
use crate::types::NodeId;

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature(pub [u8; 64]);

impl Ed25519Signature {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// The zero signature (invalid, used as placeholder).
    pub const ZERO: Self = Self([0u8; 64]);
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Sig({}...)", &hex::encode(self.0)[..16])
    }
}

/// Derive a node id from a signing public key.
pub fn node_id_for(sign_pub: &[u8; 32]) -> NodeId {
    NodeId(*blake3::hash(sign_pub).as_bytes())
}

// ─────────────────────────────────────────────────────────────────────────────
// Their view
// ─────────────────────────────────────────────────────────────────────────────

/// Public half of a node's identity, as known to its peers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTheir {
    pub id: NodeId,
    pub exch_pub: [u8; 32],
    pub sign_pub: [u8; 32],
    pub noise_pub: [u8; 32],
}

impl NodeTheir {
    /// Build a peer view from its public keys, deriving the id.
    pub fn new(exch_pub: [u8; 32], sign_pub: [u8; 32], noise_pub: [u8; 32]) -> Self {
        Self {
            id: node_id_for(&sign_pub),
            exch_pub,
            sign_pub,
            noise_pub,
        }
    }

    /// Verify a signature made by this node's signing key.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.sign_pub).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = Signature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }

    /// Serialize to CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR, checking that the id matches the signing key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let their: Self =
            ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))?;
        if their.id != node_id_for(&their.sign_pub) {
            return Err(CoreError::IdentityMismatch);
        }
        Ok(their)
    }
}

impl fmt::Debug for NodeTheir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeTheir({:?})", self.id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Our view
// ─────────────────────────────────────────────────────────────────────────────

/// Our own identity, including private keys.
#[derive(Clone)]
pub struct NodeOur {
    signing_key: SigningKey,
    exch_secret: StaticSecret,
    noise_secret: StaticSecret,
    their: NodeTheir,
}

impl NodeOur {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let signing_key = SigningKey::generate(&mut rng);
        let exch_secret = StaticSecret::random_from_rng(&mut rng);
        let noise_secret = StaticSecret::random_from_rng(&mut rng);
        Self::assemble(signing_key, exch_secret, noise_secret)
    }

    /// Rebuild an identity from its three 32-byte seeds.
    pub fn from_seeds(sign_seed: &[u8; 32], exch_seed: [u8; 32], noise_seed: [u8; 32]) -> Self {
        Self::assemble(
            SigningKey::from_bytes(sign_seed),
            StaticSecret::from(exch_seed),
            StaticSecret::from(noise_seed),
        )
    }

    fn assemble(signing_key: SigningKey, exch_secret: StaticSecret, noise_secret: StaticSecret) -> Self {
        let their = NodeTheir::new(
            X25519PublicKey::from(&exch_secret).to_bytes(),
            signing_key.verifying_key().to_bytes(),
            X25519PublicKey::from(&noise_secret).to_bytes(),
        );
        Self {
            signing_key,
            exch_secret,
            noise_secret,
            their,
        }
    }

    /// Our node id.
    pub fn id(&self) -> NodeId {
        self.their.id
    }

    /// The public view peers hold of us.
    pub fn their(&self) -> &NodeTheir {
        &self.their
    }

    /// Sign a message with our long-term signing key.
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Ed25519Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Our X25519 exchange secret.
    pub fn exch_secret(&self) -> &StaticSecret {
        &self.exch_secret
    }

    /// Raw Noise static private key, in the form the handshake builder takes.
    pub fn noise_private(&self) -> [u8; 32] {
        self.noise_secret.to_bytes()
    }

    /// The seeds this identity can be rebuilt from (secret key material).
    pub fn seeds(&self) -> ([u8; 32], [u8; 32], [u8; 32]) {
        (
            self.signing_key.to_bytes(),
            self.exch_secret.to_bytes(),
            self.noise_secret.to_bytes(),
        )
    }
}

impl fmt::Debug for NodeOur {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeOur({:?})", self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let node = NodeOur::generate();
        let signature = node.sign(b"hello world");

        node.their()
            .verify(b"hello world", &signature)
            .expect("valid signature should verify");
        assert!(node.their().verify(b"hello worlD", &signature).is_err());
    }

    #[test]
    fn test_id_is_hash_of_signing_key() {
        let node = NodeOur::generate();
        let expected = blake3::hash(&node.their().sign_pub);
        assert_eq!(node.id().as_bytes(), expected.as_bytes());
    }

    #[test]
    fn test_deterministic_from_seeds() {
        let a = NodeOur::from_seeds(&[1u8; 32], [2u8; 32], [3u8; 32]);
        let b = NodeOur::from_seeds(&[1u8; 32], [2u8; 32], [3u8; 32]);
        assert_eq!(a.their(), b.their());

        let (s, e, n) = a.seeds();
        let c = NodeOur::from_seeds(&s, e, n);
        assert_eq!(a.id(), c.id());
    }

    #[test]
    fn test_their_cbor_roundtrip() {
        let node = NodeOur::generate();
        let bytes = node.their().to_bytes().unwrap();
        let back = NodeTheir::from_bytes(&bytes).unwrap();
        assert_eq!(&back, node.their());
    }

    #[test]
    fn test_their_rejects_forged_id() {
        let node = NodeOur::generate();
        let mut forged = node.their().clone();
        forged.id = NodeId::from_bytes([9u8; 32]);
        let bytes = forged.to_bytes().unwrap();
        assert!(matches!(
            NodeTheir::from_bytes(&bytes),
            Err(CoreError::IdentityMismatch)
        ));
    }
}
