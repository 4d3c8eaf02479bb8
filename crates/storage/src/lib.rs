//! Storage abstractions and backends for the Larder data cache.
//!
//! This crate provides:
//! - The [`CacheVolume`] trait: a named byte store holding restored copies
//!   of repository files, with atomic streamed writes
//! - The [`BagArchive`] trait: the contract for the slow long-term storage
//!   that objects are restored from (drivers live elsewhere)
//! - A local-filesystem volume backend

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemVolume;
pub use error::{StorageError, StorageResult};
pub use traits::{
    ArchiveFileInfo, BagArchive, ByteStream, CacheVolume, ObjectMeta, VolumeWrite,
};
