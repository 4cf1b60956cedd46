//! Error types for the packet codec.

use relaycopy_core::NodeId;
use thiserror::Error;

/// Errors that can occur while encoding or decoding packets.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Magic is not one we know.
    #[error("bad magic")]
    BadMagic,

    /// Magic of an older, unsupported format version.
    #[error("packet format {magic} is too old")]
    TooOld { magic: String },

    /// Envelope addressed to another node.
    #[error("packet is addressed to {0}, not us")]
    WrongRecipient(NodeId),

    /// Sender is not among our known peers.
    #[error("unknown sender {0}")]
    UnknownSender(NodeId),

    /// Envelope signature does not verify.
    #[error("invalid envelope signature")]
    BadSignature,

    /// AEAD encryption failure.
    #[error("encryption error: {0}")]
    Encrypt(String),

    /// AEAD authentication failure.
    #[error("decryption failed")]
    Decrypt,

    /// Padding bytes differ from the expected stream.
    #[error("padding mismatch")]
    PadMismatch,

    /// Encoded size would exceed the allowed maximum.
    #[error("packet too big: {size} > {max}")]
    TooBig { size: u64, max: u64 },

    /// Structurally invalid data.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] relaycopy_core::CoreError),
}

/// Result type for packet operations.
pub type Result<T> = std::result::Result<T, PacketError>;
