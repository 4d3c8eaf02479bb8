//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid AIP identifier: {0}")]
    InvalidId(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("manifest error: {0}")]
    Manifest(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
