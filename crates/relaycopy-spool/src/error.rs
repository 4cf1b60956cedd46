//! Error types for the spool.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during spool operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// Lock already held by another session or tool.
    #[error("spool lock {0} is held elsewhere")]
    Locked(PathBuf),

    /// Filesystem query failed.
    #[error("filesystem error on {path}: {errno}")]
    Fs {
        path: PathBuf,
        errno: nix::errno::Errno,
    },

    /// Invalid data in the spool.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Background blocking task failed.
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] relaycopy_core::CoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;
