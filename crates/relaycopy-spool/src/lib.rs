//! # relaycopy spool
//!
//! On-disk store of pending inbound and outbound content, per peer.
//!
//! ## Overview
//!
//! Outbound content is stored under its Merkle root, so a catalog of the
//! `tx` directory is exactly what a session advertises. Inbound content
//! moves through `.part` (arriving) and `.nock` (awaiting checksum) before
//! it is committed under its root. A `seen` marker keeps processed hashes
//! from being fetched again.
//!
//! ## Key Types
//!
//! - [`Spool`] - the per-peer directory tree and its operations
//! - [`CatalogEntry`] - one advertised item: hash, size, niceness
//! - [`SpoolLock`] - advisory lock over one side of a peer's spool
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relaycopy_core::NodeId;
//! use relaycopy_spool::{Direction, LockKind, Spool};
//!
//! async fn example() {
//!     let spool = Spool::open("/var/spool/relaycopy").await.unwrap();
//!     let peer = NodeId::from_bytes([0; 32]);
//!     let _lock = spool.lock(&peer, LockKind::Tx).unwrap();
//!     let outbound = spool.catalog(&peer, Direction::Tx).await.unwrap();
//!     # let _ = outbound;
//! }
//! ```

pub mod error;
pub mod lock;
pub mod spool;

pub use error::{Result, SpoolError};
pub use lock::{LockKind, SpoolLock};
pub use spool::{CatalogEntry, Direction, Spool, StoredTx, TxWriter, NOCK_SUFFIX, PART_SUFFIX};
