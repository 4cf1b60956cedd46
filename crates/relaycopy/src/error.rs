//! Error types for a node.

use relaycopy_core::{CoreError, NodeId};
use relaycopy_packet::PacketError;
use relaycopy_spool::SpoolError;
use relaycopy_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Identity or hashing error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Packet encoding or decoding error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Spool error.
    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),

    /// Session error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Peer is not in our configuration.
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),

    /// Background blocking task failed.
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
