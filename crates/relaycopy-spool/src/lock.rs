//! Advisory directory locks.
//!
//! A session takes the per-peer `tx` and `rx` locks before touching those
//! directories, so two sessions (or a session and an offline tool) never
//! mutate the same peer's spool at once. Locks are released on drop.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{Result, SpoolError};

/// What a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Outbound directory.
    Tx,
    /// Inbound directory.
    Rx,
}

impl LockKind {
    pub(crate) fn file_name(self) -> &'static str {
        match self {
            Self::Tx => ".tx.lock",
            Self::Rx => ".rx.lock",
        }
    }
}

/// A held advisory lock.
pub struct SpoolLock {
    _flock: Flock<File>,
    path: PathBuf,
}

impl SpoolLock {
    /// Try to take an exclusive lock on `path` without blocking.
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                tracing::trace!(path = %path.display(), "lock acquired");
                Ok(Self {
                    _flock: flock,
                    path: path.to_path_buf(),
                })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(SpoolError::Locked(path.to_path_buf())),
            Err((_, errno)) => Err(SpoolError::Fs {
                path: path.to_path_buf(),
                errno,
            }),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpoolLock {
    fn drop(&mut self) {
        tracing::trace!(path = %self.path.display(), "lock released");
    }
}

impl std::fmt::Debug for SpoolLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SpoolLock({})", self.path.display())
    }
}
