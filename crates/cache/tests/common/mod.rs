//! Shared fixtures: a scripted in-memory bag archive and a restorer
//! wrapper that counts restorations.

use async_trait::async_trait;
use bytes::Bytes;
use larder_cache::{
    BagRestorer, Cache, CacheManager, CacheObjectCheck, CacheResult, ChecksumSha256Check,
    IntegrityMonitor, PdrNaming, PdrPreferences, Restoration, Restorer,
};
use larder_core::volume::roles;
use larder_core::{AipId, DatasetManifest, ManifestFile, Sha256Digest, VolumeStatus};
use larder_inventory::SqliteInventory;
use larder_storage::{
    ArchiveFileInfo, BagArchive, ByteStream, CacheVolume, FilesystemVolume, StorageError,
    StorageResult,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A scripted archive held in memory.  Versions are not differentiated:
/// every version of a dataset serves the same content.
#[derive(Default)]
pub struct FakeArchive {
    files: Mutex<HashMap<String, HashMap<String, Bytes>>>,
    bad_checksums: Mutex<HashSet<(String, String)>>,
}

impl FakeArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, dsid: &str, filepath: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .entry(dsid.to_string())
            .or_default()
            .insert(filepath.to_string(), Bytes::copy_from_slice(content));
    }

    /// Make the archive report a wrong digest for one file, so that any
    /// restoration of it fails verification.
    pub fn tamper_checksum(&self, dsid: &str, filepath: &str) {
        self.bad_checksums
            .lock()
            .unwrap()
            .insert((dsid.to_string(), filepath.to_string()));
    }

    fn content(&self, dsid: &str, filepath: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(dsid)?.get(filepath).cloned()
    }
}

#[async_trait]
impl BagArchive for FakeArchive {
    async fn exists(&self, dsid: &str, _version: Option<&str>) -> StorageResult<bool> {
        Ok(self.files.lock().unwrap().contains_key(dsid))
    }

    async fn manifest_for(
        &self,
        dsid: &str,
        version: Option<&str>,
    ) -> StorageResult<DatasetManifest> {
        let files = self.files.lock().unwrap();
        let members = files
            .get(dsid)
            .ok_or_else(|| StorageError::NotFound(dsid.to_string()))?;
        let mut listing: Vec<ManifestFile> = members
            .iter()
            .map(|(filepath, content)| ManifestFile {
                filepath: filepath.clone(),
                size: content.len() as i64,
                sha256: Sha256Digest::compute(content).to_hex(),
            })
            .collect();
        listing.sort_by(|a, b| a.filepath.cmp(&b.filepath));
        Ok(DatasetManifest {
            aipid: dsid.to_string(),
            version: version.map(str::to_string),
            files: listing,
        })
    }

    async fn describe_file(
        &self,
        dsid: &str,
        filepath: &str,
        _version: Option<&str>,
    ) -> StorageResult<ArchiveFileInfo> {
        let content = self
            .content(dsid, filepath)
            .ok_or_else(|| StorageError::NotFound(format!("{dsid}/{filepath}")))?;
        let tampered = self
            .bad_checksums
            .lock()
            .unwrap()
            .contains(&(dsid.to_string(), filepath.to_string()));
        let sha256 = if tampered {
            "0".repeat(64)
        } else {
            Sha256Digest::compute(&content).to_hex()
        };
        Ok(ArchiveFileInfo {
            size: content.len() as i64,
            sha256,
        })
    }

    async fn open_file(
        &self,
        dsid: &str,
        filepath: &str,
        _version: Option<&str>,
    ) -> StorageResult<ByteStream> {
        let content = self
            .content(dsid, filepath)
            .ok_or_else(|| StorageError::NotFound(format!("{dsid}/{filepath}")))?;
        let chunks: Vec<StorageResult<Bytes>> = content
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Wraps the real restorer, counting `restore_object` invocations.
pub struct CountingRestorer {
    inner: BagRestorer,
    pub restore_calls: AtomicUsize,
}

impl CountingRestorer {
    pub fn new(inner: BagRestorer) -> Self {
        Self {
            inner,
            restore_calls: AtomicUsize::new(0),
        }
    }

    pub fn restore_count(&self) -> usize {
        self.restore_calls.load(Ordering::SeqCst)
    }

    pub fn integrity_monitor(&self, checks: Vec<Arc<dyn CacheObjectCheck>>) -> IntegrityMonitor {
        self.inner.integrity_monitor(checks)
    }
}

#[async_trait]
impl Restorer for CountingRestorer {
    async fn does_not_exist(&self, id: &str) -> CacheResult<bool> {
        self.inner.does_not_exist(id).await
    }

    async fn size_of(&self, id: &str) -> CacheResult<i64> {
        self.inner.size_of(id).await
    }

    fn name_for_object(&self, id: &str, roles: u32) -> CacheResult<String> {
        self.inner.name_for_object(id, roles)
    }

    fn preferences_for(&self, id: &str, size: i64, defaults: u32) -> u32 {
        self.inner.preferences_for(id, size, defaults)
    }

    async fn restore_object(
        &self,
        id: &str,
        volume: Arc<dyn CacheVolume>,
        name: &str,
    ) -> CacheResult<Restoration> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.restore_object(id, volume, name).await
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
        self.inner
            .cache_dataset(dsid, version, cache, recache, prefs, target)
            .await
    }

    fn parse_id(&self, id: &str) -> CacheResult<AipId> {
        self.inner.parse_id(id)
    }
}

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub archive: Arc<FakeArchive>,
    pub restorer: Arc<CountingRestorer>,
    pub manager: Arc<CacheManager>,
    /// Root directory of the "main" data volume.
    pub data_root: PathBuf,
}

pub fn checklist() -> Vec<Arc<dyn CacheObjectCheck>> {
    vec![Arc::new(ChecksumSha256Check)]
}

/// A manager over one big data volume, a scripted archive, and a private
/// head-bag staging cache.
pub async fn fixture() -> anyhow::Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let admin = dir.path().join("admin");
    std::fs::create_dir_all(&admin)?;

    let archive = Arc::new(FakeArchive::new());

    let data_inventory = Arc::new(
        SqliteInventory::new(dir.path().join("data-inventory.sqlite")).await?,
    );
    let data_root = dir.path().join("vol-main");
    let volume = Arc::new(FilesystemVolume::new("main", &data_root).await?);
    let mut cache = Cache::new(data_inventory);
    cache
        .add_volume(
            volume,
            1 << 30,
            roles::GENERAL_PURPOSE
                | roles::SMALL_OBJECTS
                | roles::LARGE_OBJECTS
                | roles::OLD_VERSIONS,
            VolumeStatus::ForUpdate,
            Some(1),
        )
        .await?;

    let hb_inventory = Arc::new(
        SqliteInventory::new(dir.path().join("headbag-inventory.sqlite")).await?,
    );
    let hb_volume = Arc::new(
        FilesystemVolume::new("headbags", dir.path().join("vol-headbags")).await?,
    );
    let mut headbags = Cache::new(hb_inventory);
    headbags
        .add_volume(hb_volume, 1 << 24, 0, VolumeStatus::ForUpdate, None)
        .await?;

    let restorer = Arc::new(CountingRestorer::new(BagRestorer::new(
        archive.clone(),
        headbags,
    )));

    let manager = Arc::new(CacheManager::new(
        cache,
        restorer.clone(),
        Arc::new(PdrNaming),
        Arc::new(PdrPreferences::default()),
        checklist(),
        &admin,
    )?);

    Ok(Fixture {
        dir,
        archive,
        restorer,
        manager,
        data_root,
    })
}
