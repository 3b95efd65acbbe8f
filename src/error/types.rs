//! Error types for ballotd.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the daemon.
#[derive(Error, Debug)]
pub enum BallotError {
    /// Configuration-related errors.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Key material and token errors.
    #[error("Crypto error: {kind}")]
    Crypto { kind: CryptoErrorKind },

    /// Wire protocol errors.
    #[error("Protocol error: {kind}")]
    Protocol { kind: ProtocolErrorKind },

    /// Forwarding relay errors.
    #[error("Forwarding error: {kind}")]
    Forwarding { kind: ForwardingErrorKind },

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Crypto error kinds. All of these are fatal to startup for the affected
/// key; none occur during connection handling.
#[derive(Error, Debug)]
pub enum CryptoErrorKind {
    #[error("Key generation failed: {message}")]
    Keygen { message: String },

    #[error("Invalid RSA key size: {bits} bits (minimum 512)")]
    InvalidKeySize { bits: usize },

    #[error("Key not found or unreadable: {path}: {message}")]
    KeyNotFound { path: PathBuf, message: String },

    #[error("Invalid token: {message}")]
    InvalidToken { message: String },
}

/// Protocol error kinds. These are per-connection failures: the offending
/// connection is closed and reported, the listener keeps serving.
#[derive(Error, Debug)]
pub enum ProtocolErrorKind {
    #[error("Truncated input: expected {expected} bytes, peer closed after {got}")]
    TruncatedInput { expected: usize, got: usize },

    #[error("Block decryption failed")]
    Decryption,

    #[error("Malformed vote: {message}")]
    MalformedVote { message: String },

    #[error("Unknown service token")]
    UnknownToken,

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Could not determine protocol version")]
    ProtocolDetection,

    #[error("Message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid message format: {message}")]
    InvalidMessageFormat { message: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timed out")]
    ConnectionTimeout,
}

/// Forwarding error kinds. These never surface to the submitting client;
/// they drive the vote cache retry path.
#[derive(Error, Debug)]
pub enum ForwardingErrorKind {
    #[error("Forwarding target '{target}' is unreachable")]
    TargetUnreachable { target: String },

    #[error("Broker error: {message}")]
    Broker { message: String },

    #[error("Forwarding relay is shut down")]
    Shutdown,
}

impl BallotError {
    /// Whether this error names a specific unreachable forwarding target.
    pub fn is_target_unreachable(&self) -> bool {
        matches!(
            self,
            BallotError::Forwarding {
                kind: ForwardingErrorKind::TargetUnreachable { .. }
            }
        )
    }
}

/// Result type alias for daemon operations.
pub type BallotResult<T> = Result<T, BallotError>;
