//! Error types for the sync protocol.

use thiserror::Error;

/// Errors that can occur during a sync session.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure: reset, EOF, IO.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Read or write deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Record does not start with our magic.
    #[error("bad record magic")]
    BadMagic,

    /// Record or frame could not be decoded.
    #[error("invalid frame: {0}")]
    Frame(String),

    /// Frame tag we do not know.
    #[error("unknown frame type {0}")]
    UnknownFrame(u8),

    /// Handshake or transport encryption failure.
    #[error("noise error: {0}")]
    Noise(#[from] snow::Error),

    /// Handshake revealed a static key not in our peers table.
    #[error("unknown peer static key {0}")]
    UnknownPeer(String),

    /// Spool operation failed.
    #[error("spool error: {0}")]
    Spool(#[from] relaycopy_spool::SpoolError),

    /// Merkle hashing failed.
    #[error("hashing error: {0}")]
    Core(#[from] relaycopy_core::CoreError),

    /// Background task failed.
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Session was torn down.
    #[error("session is dead")]
    Dead,
}

impl SyncError {
    /// Whether the operation may simply be retried while the session lives.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Transport(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Whether the peer hung up: the session is over, not failed.
    pub fn is_hangup(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Self::Transport(e) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::WriteZero
            ),
            _ => false,
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
