//! # relaycopy
//!
//! Store-and-forward delivery of encrypted packets between nodes that are
//! only occasionally connected.
//!
//! ## Overview
//!
//! A node encrypts outbound packets for a peer and keeps them in its spool.
//! Whenever the two nodes get a connection, of any kind, they run a session
//! that moves whatever is missing in both directions:
//!
//! - **Packets**: signed envelopes encrypted per recipient, padded on request
//! - **Spool**: per-peer `tx`/`rx` directories, every item named by its
//!   Merkle root
//! - **Sessions**: Noise IK authenticated, resumable, checked end to end
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relaycopy::{Node, NodeConfig};
//! use relaycopy::core::NodeOur;
//! use relaycopy::packet::{Packet, PacketType};
//! use relaycopy::sync::Deadlined;
//!
//! async fn example<S>(stream: S, peer: relaycopy::core::NodeTheir) -> relaycopy::Result<()>
//! where
//!     S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
//! {
//!     let peer_id = peer.id;
//!     let node = Node::open(NodeOur::generate(), [peer], "/var/spool/relaycopy", NodeConfig::default()).await?;
//!
//!     let packet = Packet::new(PacketType::File, 128, "report.pdf")?;
//!     node.queue_packet(&peer_id, packet, std::fs::File::open("report.pdf")?).await?;
//!
//!     let report = node.call(Deadlined::new(stream), &peer_id).await?;
//!     for hash in report.received {
//!         let opened = node.open_received(&peer_id, &hash).await?;
//!         println!("{} bytes from {}", opened.payload.len(), opened.sender);
//!     }
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `relaycopy::core` - identities, content hashes, Merkle tree hasher
//! - `relaycopy::packet` - packet codec
//! - `relaycopy::spool` - on-disk spool
//! - `relaycopy::sync` - online session protocol

pub mod error;
pub mod node;

// Re-export component crates
pub use relaycopy_core as core;
pub use relaycopy_packet as packet;
pub use relaycopy_spool as spool;
pub use relaycopy_sync as sync;

// Re-export main types for convenience
pub use error::{NodeError, Result};
pub use node::{Node, NodeConfig, Opened};

// Re-export commonly used types
pub use relaycopy_core::{ContentHash, NodeId, NodeOur, NodeTheir};
pub use relaycopy_packet::{Packet, PacketType};
pub use relaycopy_sync::{Deadlined, SessionConfig, SessionReport};
