//! Error types shared by the sync core.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the sync core.
///
/// Merge conflicts are not represented here: a diverged offline edit is a
/// state transition handled by the offline queue, not a failure.
#[derive(Error, Debug)]
pub enum Error {
    /// No signer is logged in, or a delegation tag failed verification.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Mining hit its wall-clock or iteration ceiling before reaching the target.
    #[error(
        "proof of work timed out at difficulty {difficulty} after {iterations} iterations ({elapsed:?})"
    )]
    ProofOfWorkTimeout {
        difficulty: u8,
        iterations: u64,
        elapsed: Duration,
    },

    /// No relay accepted a publish, or a relay read failed.
    #[error("network error: {0}")]
    Network(String),

    /// Event id or signature does not match its contents.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Offline edit whose type does not fit its payload.
    #[error("invalid offline edit: {0}")]
    InvalidEdit(String),

    /// Durable key-value store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Key parsing, signing or verification failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A blocking worker task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<secp256k1::Error> for Error {
    fn from(err: secp256k1::Error) -> Self {
        Error::Crypto(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::Crypto(format!("invalid hex: {err}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
