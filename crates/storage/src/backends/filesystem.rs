//! Local filesystem cache volume.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, CacheVolume, ObjectMeta, VolumeWrite};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// A cache volume rooted at a local directory.
///
/// Object names map to paths below the root.  Writes land in a temp file
/// that is fsynced and renamed into place, so concurrent readers never see
/// a partial object.
pub struct FilesystemVolume {
    name: String,
    root: PathBuf,
}

impl FilesystemVolume {
    /// Create a volume, creating its root directory if needed.
    pub async fn new(name: impl Into<String>, root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            name: name.into(),
            root,
        })
    }

    /// Map an object name to its path, rejecting names that would escape
    /// the volume root.  Names come from this workspace's naming policies,
    /// but identifiers originate outside it, so the check stays.
    fn object_path(&self, name: &str) -> StorageResult<PathBuf> {
        if name.is_empty() || name.starts_with('/') || name.contains("..") {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        for component in Path::new(name).components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => return Err(StorageError::InvalidName(name.to_string())),
            }
        }
        Ok(self.root.join(name))
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn temp_path_for(path: &Path) -> PathBuf {
        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or(temp_name),
        )
    }

    fn map_not_found(name: &str, e: std::io::Error) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(name.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl CacheVolume for FilesystemVolume {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(volume = %self.name))]
    async fn exists(&self, name: &str) -> StorageResult<bool> {
        let path = self.object_path(name)?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(volume = %self.name))]
    async fn get(&self, name: &str) -> StorageResult<Bytes> {
        let path = self.object_path(name)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| Self::map_not_found(name, e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(volume = %self.name))]
    async fn get_stream(&self, name: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.object_path(name)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| Self::map_not_found(name, e))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(volume = %self.name, size = data.len()))]
    async fn save(&self, name: &str, data: Bytes) -> StorageResult<()> {
        let mut writer = self.save_stream(name).await?;
        writer.write(data).await?;
        writer.finish().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(volume = %self.name))]
    async fn save_stream(&self, name: &str) -> StorageResult<Box<dyn VolumeWrite>> {
        let path = self.object_path(name)?;
        Self::ensure_parent(&path).await?;

        let temp_path = Self::temp_path_for(&path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemWrite {
            file,
            temp_path,
            final_path: path,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(volume = %self.name))]
    async fn remove(&self, name: &str) -> StorageResult<()> {
        let path = self.object_path(name)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::map_not_found(name, e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(volume = %self.name))]
    async fn describe(&self, name: &str) -> StorageResult<ObjectMeta> {
        let path = self.object_path(name)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| Self::map_not_found(name, e))?;
        Ok(ObjectMeta {
            size: metadata.len(),
            modified: metadata.modified().ok().map(Into::into),
        })
    }
}

/// Streamed write into a filesystem volume.
struct FilesystemWrite {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl VolumeWrite for FilesystemWrite {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        // Flush to disk before the rename makes the object visible.
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
        Ok(())
    }
}
