//! Inventory error types.

use thiserror::Error;

/// Inventory operation errors.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("inventory search failed: {0}")]
    Search(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("not a registered volume: {0}")]
    VolumeNotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("inventory error: {0}")]
    Internal(String),
}

/// Result type for inventory operations.
pub type InventoryResult<T> = std::result::Result<T, InventoryError>;
