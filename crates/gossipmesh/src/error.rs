//! Membership-specific error types.

use thiserror::Error;

/// Result type for membership operations.
pub type Result<T> = std::result::Result<T, MembershipError>;

/// Errors surfaced by the membership layer.
///
/// Transient network failures are logged and absorbed by the failure
/// detector rather than reported here; the variants below cover transport
/// setup, framing, and lifecycle misuse.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("No known peers")]
    NoPeers,

    #[error("Join failed: {0}")]
    JoinFailed(String),

    #[error("Remote state exchange failed: {0}")]
    PushPull(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Membership is shut down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for MembershipError {
    fn from(err: bincode::Error) -> Self {
        MembershipError::Serialization(err.to_string())
    }
}
