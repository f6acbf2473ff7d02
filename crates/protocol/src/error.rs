//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// A frame failed its integrity check.
    #[error("frame integrity check failed")]
    Integrity,

    /// Invalid or malformed key material.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    // Handshake errors
    /// Key exchange failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer could not be authenticated.
    ///
    /// Deliberately carries no detail about which credential was rejected.
    #[error("authentication failed")]
    AuthenticationFailed,

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame carries an unknown type tag.
    #[error("invalid frame tag: {0:#04x}")]
    InvalidFrameTag(u8),

    /// The peer sent a command that does not follow the protocol.
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    // Connection errors
    /// Connection was closed, either by the peer or locally.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    // Collaborator errors
    /// A message cache operation failed.
    #[error("message cache error: {0}")]
    Cache(String),

    /// The consumer of forwarded or subscription requests has gone away.
    #[error("request sink closed: {0}")]
    SinkClosed(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<snow::Error> for ProtocolError {
    fn from(err: snow::Error) -> Self {
        // Every snow operation in this crate happens during key exchange.
        ProtocolError::HandshakeFailed(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProtocolError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ProtocolError::Timeout(err.to_string())
    }
}
