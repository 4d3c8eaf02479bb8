//! Cache management error types.

use larder_inventory::InventoryError;
use larder_storage::StorageError;
use thiserror::Error;

/// Cache management errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The identifier has no backing in the archive.  Never retried.
    #[error("resource not found in archive: {0}")]
    NotFound(String),

    /// Trouble with a cache volume; possibly transient.
    #[error("storage volume error: {0}")]
    Volume(#[from] StorageError),

    /// Inventory persistence failure; always surfaced.
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// The archive stream ended early or the checksum did not match; the
    /// partial object has been removed.
    #[error("restoration of {id} failed: {reason}")]
    Restoration { id: String, reason: String },

    /// No volume can accommodate the object.
    #[error("no cache volume can accommodate {size} bytes (preferences {prefs:#x})")]
    VolumeNotAvailable { size: i64, prefs: u32 },

    /// A cooperative stop request arrived.
    #[error("operation interrupted")]
    Interrupted,

    #[error(transparent)]
    Id(#[from] larder_core::Error),

    #[error("cache management error: {0}")]
    Management(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
