//! Error types for relaycopy core.

use thiserror::Error;

/// Core errors: identifier parsing, identities, hashing I/O.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid base32 identifier: {0}")]
    Base32(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("identity mismatch: id is not the hash of the signing key")]
    IdentityMismatch,

    #[error("hasher started at offset {0} but no prefix was added")]
    PrefixMissing(u64),

    #[error("hasher already finished")]
    HasherFinished,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
