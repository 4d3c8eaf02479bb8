//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use larder_core::DatasetManifest;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub modified: Option<time::OffsetDateTime>,
}

/// A named byte store holding restored copies of repository files.
///
/// Object names may contain `/` separators; backends map them to whatever
/// layout suits the medium.  Writes are atomic: a reader never observes a
/// partially written object under its final name.
#[async_trait]
pub trait CacheVolume: Send + Sync + 'static {
    /// The volume's registered name.
    fn name(&self) -> &str;

    /// Check whether an object exists.
    async fn exists(&self, name: &str) -> StorageResult<bool>;

    /// Read an object's full contents.
    async fn get(&self, name: &str) -> StorageResult<Bytes>;

    /// Read an object as a byte stream.
    async fn get_stream(&self, name: &str) -> StorageResult<ByteStream>;

    /// Store an object from a whole in-memory buffer.
    async fn save(&self, name: &str, data: Bytes) -> StorageResult<()>;

    /// Start a streamed write.  The object appears under `name` only when
    /// the returned writer's `finish` succeeds.
    async fn save_stream(&self, name: &str) -> StorageResult<Box<dyn VolumeWrite>>;

    /// Remove an object.
    async fn remove(&self, name: &str) -> StorageResult<()>;

    /// Describe an object without reading its contents.
    async fn describe(&self, name: &str) -> StorageResult<ObjectMeta>;
}

/// Handle for an in-progress streamed write into a volume.
#[async_trait]
pub trait VolumeWrite: Send {
    /// Append a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Commit the write and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abandon the write, discarding anything already written.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// What the archive knows about one member file of a dataset.
#[derive(Clone, Debug)]
pub struct ArchiveFileInfo {
    /// Size in bytes.
    pub size: i64,
    /// Hex SHA-256 digest recorded when the bag was preserved.
    pub sha256: String,
}

/// The long-term bag archive that cache misses are restored from.
///
/// This is an interface contract only; concrete drivers (object stores,
/// on-prem bag servers) are provided by the embedding application.  A
/// dataset's head bag yields its [`DatasetManifest`]; member files are
/// addressed by `(dsid, filepath, version)` with `None` meaning the latest
/// released version.
#[async_trait]
pub trait BagArchive: Send + Sync + 'static {
    /// Check whether the archive holds the named dataset (version).
    async fn exists(&self, dsid: &str, version: Option<&str>) -> StorageResult<bool>;

    /// Fetch the dataset's manifest from its head bag.
    async fn manifest_for(&self, dsid: &str, version: Option<&str>)
        -> StorageResult<DatasetManifest>;

    /// Describe a member file without fetching it.
    async fn describe_file(
        &self,
        dsid: &str,
        filepath: &str,
        version: Option<&str>,
    ) -> StorageResult<ArchiveFileInfo>;

    /// Open a member file for reading.
    async fn open_file(
        &self,
        dsid: &str,
        filepath: &str,
        version: Option<&str>,
    ) -> StorageResult<ByteStream>;
}
