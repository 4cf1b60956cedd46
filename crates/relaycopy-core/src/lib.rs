//! # relaycopy core
//!
//! Pure primitives shared by every relaycopy layer: identifiers, node
//! identities and the Merkle Tree Hasher used to address content.
//!
//! This crate performs no networking. Its only I/O is reading the
//! prefix a resumed hasher needs.
//!
//! ## Key Types
//!
//! - [`NodeId`] - Blake3 hash of a node's signing key
//! - [`ContentHash`] - Merkle root naming a blob
//! - [`NodeOur`] / [`NodeTheir`] - private and public node identities
//! - [`MthSeq`] / [`MthFat`] - sequential and reference Merkle hashers

pub mod crypto;
pub mod error;
pub mod mth;
pub mod types;

pub use crypto::{node_id_for, Ed25519Signature, NodeOur, NodeTheir};
pub use error::{CoreError, Result};
pub use mth::{hash_bytes, hash_reader, MerkleTree, MthFat, MthSeq, MTH_BLOCK_SIZE};
pub use types::{base32_decode, base32_encode, ContentHash, NodeId};
