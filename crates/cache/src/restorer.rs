//! Restoring objects and datasets from the long-term bag archive.

use crate::cache::Cache;
use crate::error::{CacheError, CacheResult};
use crate::integrity::{CacheObjectCheck, IntegrityMonitor};
use crate::policy::{NamingPolicy, PdrNaming, PdrPreferences, PreferencePolicy};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use larder_core::{AipId, DatasetManifest, Sha256Digest, DEFAULT_ALGORITHM};
use larder_inventory::InventoryMutator;
use larder_storage::{BagArchive, CacheVolume, StorageError};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// What a completed restoration produced.
#[derive(Clone, Debug)]
pub struct Restoration {
    /// Bytes written into the volume.
    pub bytes: u64,
    /// Hex SHA-256 digest computed while streaming.
    pub checksum: String,
    /// Metadata for the new inventory row (size, checksum, provenance).
    pub metadata: Value,
}

/// Knows how to fetch archived objects into cache volumes.
#[async_trait]
pub trait Restorer: Send + Sync {
    /// Negative existence check against the archive.
    async fn does_not_exist(&self, id: &str) -> CacheResult<bool>;

    /// The size of the identified object, per the archive's records.
    async fn size_of(&self, id: &str) -> CacheResult<i64>;

    /// The in-volume name for an object, given the target volume's roles.
    fn name_for_object(&self, id: &str, roles: u32) -> CacheResult<String>;

    /// Placement preferences for an object; `defaults` is returned when
    /// no specific preference applies.
    fn preferences_for(&self, id: &str, size: i64, defaults: u32) -> u32;

    /// Stream the identified object out of the archive into the volume
    /// under `name`, verifying its checksum en route.  A short stream or a
    /// digest mismatch removes the partial write and fails.
    async fn restore_object(
        &self,
        id: &str,
        volume: Arc<dyn CacheVolume>,
        name: &str,
    ) -> CacheResult<Restoration>;

    /// Restore every member file of a dataset into the cache.  Returns the
    /// in-volume names written by this call; members already cached are
    /// skipped unless `recache` is set.  `target` pins placement to one
    /// named volume.
    async fn cache_dataset(
        &self,
        dsid: &str,
        version: Option<&str>,
        cache: &Cache,
        recache: bool,
        prefs: u32,
        target: Option<&str>,
    ) -> CacheResult<BTreeSet<String>>;

    /// Split an identifier into its dataset, filepath, and version parts.
    fn parse_id(&self, id: &str) -> CacheResult<AipId> {
        Ok(AipId::parse(id)?)
    }
}

/// The PDR restorer: reads bag archives, with a private staging cache for
/// dataset manifests (the head-bag contents) so repeated dataset operations
/// do not refetch them from slow storage.
pub struct BagRestorer {
    archive: Arc<dyn BagArchive>,
    headbags: Cache,
    naming: PdrNaming,
    preferences: PdrPreferences,
}

impl BagRestorer {
    /// Build a restorer over an archive and a staging cache.  The staging
    /// cache should be small and separate from the data cache; it gets its
    /// own inventory.
    pub fn new(archive: Arc<dyn BagArchive>, headbags: Cache) -> Self {
        Self {
            archive,
            headbags,
            naming: PdrNaming,
            preferences: PdrPreferences::default(),
        }
    }

    pub fn with_small_size_limit(mut self, limit: i64) -> Self {
        self.preferences = PdrPreferences {
            small_size_limit: limit,
        };
        self
    }

    /// An integrity monitor bound to the manifest staging cache.
    pub fn integrity_monitor(&self, checks: Vec<Arc<dyn CacheObjectCheck>>) -> IntegrityMonitor {
        self.headbags.integrity_monitor("headbags", checks)
    }

    fn manifest_name(dsid: &str, version: Option<&str>) -> String {
        match version {
            Some(v) => format!("{dsid}/_v/{v}/_manifest.json"),
            None => format!("{dsid}/_manifest.json"),
        }
    }

    fn manifest_id(dsid: &str, version: Option<&str>) -> String {
        match version {
            Some(v) => format!("{dsid}#{v}"),
            None => dsid.to_string(),
        }
    }

    fn archive_miss(id: &str, e: StorageError) -> CacheError {
        if e.is_not_found() {
            CacheError::NotFound(id.to_string())
        } else {
            CacheError::Volume(e)
        }
    }

    /// Fetch a dataset's manifest, preferring the staged copy.
    async fn manifest(&self, dsid: &str, version: Option<&str>) -> CacheResult<DatasetManifest> {
        let mid = Self::manifest_id(dsid, version);
        if let Some(staged) = self.headbags.find_cached(&mid).await? {
            if let Some(volume) = self.headbags.get_volume(&staged.volume) {
                match volume.get(&staged.name).await {
                    Ok(data) => match DatasetManifest::from_json(&data) {
                        Ok(manifest) => return Ok(manifest),
                        Err(e) => {
                            tracing::warn!("staged manifest for {mid} is unreadable: {e}; refetching");
                            self.headbags.uncache(&mid).await?;
                        }
                    },
                    Err(StorageError::NotFound(_)) => {
                        self.headbags.uncache(&mid).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let manifest = self
            .archive
            .manifest_for(dsid, version)
            .await
            .map_err(|e| Self::archive_miss(&mid, e))?;

        // stage it for the next dataset operation
        let data = manifest.to_json()?;
        let name = Self::manifest_name(dsid, version);
        let reservation = self.headbags.reserve_space(data.len() as i64, 0).await?;
        reservation
            .volume
            .save(&name, Bytes::from(data.clone()))
            .await?;
        let metadata = json!({
            "size": data.len(),
            "checksum": Sha256Digest::compute(&data).to_hex(),
            "checksumAlgorithm": DEFAULT_ALGORITHM,
        });
        self.headbags
            .inventory()
            .add_object(&mid, reservation.volume_name(), &name, Some(&metadata))
            .await?;

        Ok(manifest)
    }
}

#[async_trait]
impl Restorer for BagRestorer {
    async fn does_not_exist(&self, id: &str) -> CacheResult<bool> {
        let aip = self.parse_id(id)?;
        if !self
            .archive
            .exists(aip.dsid(), aip.version())
            .await
            .map_err(CacheError::Volume)?
        {
            return Ok(true);
        }
        match aip.filepath() {
            None => Ok(false),
            Some(filepath) => match self.manifest(aip.dsid(), aip.version()).await {
                Ok(manifest) => Ok(manifest.find_file(filepath).is_none()),
                Err(CacheError::NotFound(_)) => Ok(true),
                Err(e) => Err(e),
            },
        }
    }

    async fn size_of(&self, id: &str) -> CacheResult<i64> {
        let aip = self.parse_id(id)?;
        let manifest = self.manifest(aip.dsid(), aip.version()).await?;
        match aip.filepath() {
            None => Ok(manifest.total_size()),
            Some(filepath) => manifest
                .find_file(filepath)
                .map(|f| f.size)
                .ok_or_else(|| CacheError::NotFound(id.to_string())),
        }
    }

    fn name_for_object(&self, id: &str, roles: u32) -> CacheResult<String> {
        self.naming.name_for(id, roles)
    }

    fn preferences_for(&self, id: &str, size: i64, defaults: u32) -> u32 {
        match self.preferences.preferences_for(id, size) {
            0 => defaults,
            p => p,
        }
    }

    async fn restore_object(
        &self,
        id: &str,
        volume: Arc<dyn CacheVolume>,
        name: &str,
    ) -> CacheResult<Restoration> {
        let aip = self.parse_id(id)?;
        let filepath = aip.filepath().ok_or_else(|| {
            CacheError::Management(format!("cannot restore a whole dataset as one object: {id}"))
        })?;

        let info = self
            .archive
            .describe_file(aip.dsid(), filepath, aip.version())
            .await
            .map_err(|e| Self::archive_miss(id, e))?;
        let mut stream = self
            .archive
            .open_file(aip.dsid(), filepath, aip.version())
            .await
            .map_err(|e| Self::archive_miss(id, e))?;

        let mut writer = volume.save_stream(name).await?;
        let mut hasher = Sha256Digest::hasher();
        let mut bytes: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    writer.abort().await.ok();
                    return Err(CacheError::Restoration {
                        id: id.to_string(),
                        reason: format!("archive stream failed: {e}"),
                    });
                }
            };
            hasher.update(&chunk);
            bytes += chunk.len() as u64;
            if let Err(e) = writer.write(chunk).await {
                writer.abort().await.ok();
                return Err(CacheError::Volume(e));
            }
        }
        let checksum = hasher.finalize().to_hex();

        if info.size >= 0 && bytes != info.size as u64 {
            writer.abort().await.ok();
            return Err(CacheError::Restoration {
                id: id.to_string(),
                reason: format!("archive stream ended early: got {bytes} of {} bytes", info.size),
            });
        }
        if !info.sha256.is_empty() && !checksum.eq_ignore_ascii_case(&info.sha256) {
            writer.abort().await.ok();
            return Err(CacheError::Restoration {
                id: id.to_string(),
                reason: format!(
                    "checksum mismatch: archive records {}, stream hashed to {checksum}",
                    info.sha256
                ),
            });
        }
        writer.finish().await?;

        let mut metadata = json!({
            "size": bytes,
            "checksum": checksum,
            "checksumAlgorithm": DEFAULT_ALGORITHM,
            "aipid": aip.dsid(),
            "filepath": filepath,
        });
        if let Some(v) = aip.version() {
            metadata["version"] = Value::String(v.to_string());
        }

        Ok(Restoration {
            bytes,
            checksum,
            metadata,
        })
    }

    async fn cache_dataset(
        &self,
        dsid: &str,
        version: Option<&str>,
        cache: &Cache,
        recache: bool,
        prefs: u32,
        target: Option<&str>,
    ) -> CacheResult<BTreeSet<String>> {
        let manifest = self.manifest(dsid, version).await?;
        let mut written = BTreeSet::new();

        for file in &manifest.files {
            let id = match version {
                Some(v) => format!("{dsid}/{}#{v}", file.filepath),
                None => format!("{dsid}/{}", file.filepath),
            };
            if !recache && cache.is_cached(&id).await? {
                continue;
            }

            let file_prefs = if prefs != 0 {
                prefs
            } else {
                self.preferences.preferences_for(&id, file.size)
            };
            let reservation = match target {
                Some(volume) => cache.reserve_space_on(volume, file.size).await?,
                None => cache.reserve_space(file.size, file_prefs).await?,
            };
            let roles = cache.volume_roles(reservation.volume_name()).await?;
            let name = self.naming.name_for(&id, roles)?;

            if recache {
                cache.uncache(&id).await?;
            }
            let restoration = self
                .restore_object(&id, reservation.volume.clone(), &name)
                .await?;
            cache
                .inventory()
                .add_object(
                    &id,
                    reservation.volume_name(),
                    &name,
                    Some(&restoration.metadata),
                )
                .await?;
            tracing::info!(dataset = dsid, "cached {id} into {}", reservation.volume_name());
            written.insert(name);
        }

        Ok(written)
    }
}
