//! The cache manager: the public caching contract.

use crate::cache::Cache;
use crate::error::{CacheError, CacheResult};
use crate::integrity::{CacheObjectCheck, IntegrityMonitor};
use crate::policy::{NamingPolicy, PreferencePolicy};
use crate::queue::CacheQueue;
use crate::restorer::Restorer;
use crate::status::{MonitorStatus, MonitorStatusFile};
use async_trait::async_trait;
use larder_core::{AipId, CacheObject, VolumeStatus};
use larder_inventory::{DatasetSummary, InventoryMutator, InventoryReader, InventoryStore};
use larder_storage::ByteStream;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// The capability workers need from the manager: placing and dropping
/// cache content.  Workers receive this interface, never the manager type.
#[async_trait]
pub trait Placement: Send + Sync {
    /// Ensure at least one live copy of `id` exists; return its descriptor.
    async fn cache(&self, id: &str, recache: bool, prefs: u32) -> CacheResult<CacheObject>;

    /// Cache every member file of a dataset; return the names written.
    async fn cache_dataset(
        &self,
        dsid: &str,
        version: Option<&str>,
        recache: bool,
        prefs: u32,
        target: Option<&str>,
    ) -> CacheResult<BTreeSet<String>>;

    /// True when a readable copy of `id` exists.
    async fn is_cached(&self, id: &str) -> CacheResult<bool>;

    /// Remove all live copies of `id`.
    async fn uncache(&self, id: &str) -> CacheResult<()>;
}

/// Coordinates restoration, placement, and inventory bookkeeping, and
/// carries the administrative state the status endpoints read.
///
/// Naming and preference decisions are delegated to injected policies;
/// restoration to the injected [`Restorer`].  Concurrent `cache` calls for
/// one id are single-flight: the second caller waits and reuses the first
/// caller's result.
pub struct CacheManager {
    cache: Arc<Cache>,
    restorer: Arc<dyn Restorer>,
    naming: Arc<dyn NamingPolicy>,
    preferences: Arc<dyn PreferencePolicy>,
    data_monitor: IntegrityMonitor,
    queue: Arc<CacheQueue>,
    status_file: Arc<MonitorStatusFile>,
    monitor_running: Arc<AtomicBool>,
    restore_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CacheManager {
    /// Build a manager over a cache, a restorer, and the policies.  The
    /// administrative directory (queue file, monitor status document) must
    /// already exist.
    pub fn new(
        cache: Cache,
        restorer: Arc<dyn Restorer>,
        naming: Arc<dyn NamingPolicy>,
        preferences: Arc<dyn PreferencePolicy>,
        checklist: Vec<Arc<dyn CacheObjectCheck>>,
        admin_dir: &Path,
    ) -> CacheResult<Self> {
        if !admin_dir.is_dir() {
            return Err(CacheError::Management(format!(
                "not an existing directory: {}",
                admin_dir.display()
            )));
        }
        let data_monitor = cache.integrity_monitor("data", checklist);
        Ok(Self {
            cache: Arc::new(cache),
            restorer,
            naming,
            preferences,
            data_monitor,
            queue: Arc::new(CacheQueue::new(admin_dir.join("cacheq"))),
            status_file: Arc::new(MonitorStatusFile::new(admin_dir.join("monitorstatus.json"))),
            monitor_running: Arc::new(AtomicBool::new(false)),
            restore_locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn inventory(&self) -> Arc<dyn InventoryStore> {
        self.cache.inventory()
    }

    /// The persistent queue behind [`Self::queue_cache`]; hand it to a
    /// [`crate::CacherWorker`].
    pub fn queue(&self) -> Arc<CacheQueue> {
        self.queue.clone()
    }

    /// The monitor status document; hand it to a [`crate::MonitorWorker`].
    pub fn status_file(&self) -> Arc<MonitorStatusFile> {
        self.status_file.clone()
    }

    /// The integrity monitor over the data cache.
    pub fn data_monitor(&self) -> IntegrityMonitor {
        self.data_monitor.clone()
    }

    /// Liveness flag shared with the monitor worker so status reads can
    /// report whether continuous checking is up.
    pub fn monitor_running_flag(&self) -> Arc<AtomicBool> {
        self.monitor_running.clone()
    }

    /// Default placement preferences for an object of the given size.
    pub fn default_preferences_for(&self, id: &str, size: i64) -> u32 {
        self.restorer.preferences_for(id, size, 0)
    }

    /// Ensure at least one live copy of `id` exists and return its
    /// descriptor.  With `recache`, any existing copies are replaced; the
    /// id may briefly be uncached while the swap happens.  A transient
    /// volume failure is retried once on an alternative volume.
    pub async fn cache(&self, id: &str, recache: bool, prefs: u32) -> CacheResult<CacheObject> {
        let lock = self.id_lock(id);
        let guard = lock.lock().await;
        let result = self.cache_serialized(id, recache, prefs).await;
        drop(guard);
        self.prune_locks();
        result
    }

    async fn cache_serialized(
        &self,
        id: &str,
        recache: bool,
        prefs: u32,
    ) -> CacheResult<CacheObject> {
        if !recache {
            if let Some(existing) = self.cache.find_cached(id).await? {
                return Ok(existing);
            }
        }

        let size = self.restorer.size_of(id).await?;
        let prefs = if prefs != 0 {
            prefs
        } else {
            self.preferences.preferences_for(id, size)
        };

        let mut excluded: Option<String> = None;
        for attempt in 0..2u8 {
            let reservation = self
                .cache
                .reserve_space_excluding(size, prefs, excluded.as_deref())
                .await?;
            let volname = reservation.volume_name().to_string();
            let roles = self.cache.volume_roles(&volname).await?;
            let name = self.naming.name_for(id, roles)?;

            if recache && attempt == 0 {
                self.cache.uncache(id).await?;
            }

            match self
                .restorer
                .restore_object(id, reservation.volume.clone(), &name)
                .await
            {
                Ok(restoration) => {
                    let object = self
                        .cache
                        .inventory()
                        .add_object(id, &volname, &name, Some(&restoration.metadata))
                        .await?;
                    tracing::info!(volume = %volname, "cached {id} ({} bytes)", restoration.bytes);
                    return Ok(object);
                }
                Err(CacheError::Volume(e)) if attempt == 0 => {
                    tracing::warn!(
                        volume = %volname,
                        "restoration failed with a storage error ({e}); retrying on an \
                         alternative volume"
                    );
                    excluded = Some(volname);
                }
                Err(e) => return Err(e),
            }
        }
        Err(CacheError::VolumeNotAvailable { size, prefs })
    }

    /// Open the identified object for reading, caching it first if needed.
    pub async fn get_object(&self, id: &str) -> CacheResult<(ByteStream, CacheObject)> {
        let object = match self.cache.find_cached(id).await? {
            Some(object) => object,
            None => self.cache(id, false, 0).await?,
        };
        let volume = self.cache.get_volume(&object.volume).ok_or_else(|| {
            CacheError::Management(format!(
                "cached copy of {id} lives in unattached volume {}",
                object.volume
            ))
        })?;
        let stream = volume.get_stream(&object.name).await?;
        Ok((stream, object))
    }

    pub async fn is_cached(&self, id: &str) -> CacheResult<bool> {
        self.cache.is_cached(id).await
    }

    pub async fn uncache(&self, id: &str) -> CacheResult<()> {
        self.cache.uncache(id).await
    }

    /// Cache all member files of a dataset.
    pub async fn cache_dataset(
        &self,
        dsid: &str,
        version: Option<&str>,
        recache: bool,
        prefs: u32,
        target: Option<&str>,
    ) -> CacheResult<BTreeSet<String>> {
        self.restorer
            .cache_dataset(dsid, version, &self.cache, recache, prefs, target)
            .await
    }

    /// Queue a dataset or file to be cached asynchronously.  Identifiers
    /// with no backing in the archive are rejected.  A [`crate::CacherWorker`]
    /// drains the queue.
    pub async fn queue_cache(&self, id: &str, recache: bool) -> CacheResult<()> {
        if self.restorer.does_not_exist(id).await? {
            return Err(CacheError::NotFound(id.to_string()));
        }
        self.queue.queue(id, recache).await
    }

    /// Conditionally queue caching work for an identifier: a whole dataset
    /// when none of it is cached, a single file when only it is missing,
    /// and nothing otherwise.  Never restores synchronously.
    pub async fn optimally_cache(&self, id: &str, _prefs: u32) -> CacheResult<()> {
        let aip = self.restorer.parse_id(id)?;
        let summary = self.cache.inventory().summarize_dataset(aip.dsid()).await?;

        if summary.filecount == 0 {
            let dataset_id = AipId::for_dataset(aip.dsid(), aip.version()).to_string();
            match self.queue_cache(&dataset_id, false).await {
                Ok(()) => {
                    tracing::info!("cache-queuing {dataset_id} triggered by user demand");
                }
                Err(CacheError::NotFound(_)) => {
                    tracing::debug!("requested dataset {} not found; ignoring", aip.dsid());
                }
                Err(e) => return Err(e),
            }
            return Ok(());
        }

        if !aip.is_dataset() && !self.is_cached(id).await? {
            match self.queue_cache(id, false).await {
                Ok(()) => tracing::info!("cache-queuing {id}"),
                Err(CacheError::NotFound(_)) => {
                    tracing::warn!("requested file for caching, {id}, not found");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Synchronously integrity-check everything cached from one dataset.
    /// Returns the objects that failed and were deleted; with `recache`,
    /// fresh copies of the failures are restored before returning.
    pub async fn check(&self, aipid: &str, recache: bool) -> CacheResult<Vec<CacheObject>> {
        let cached = self
            .select_dataset_objects(aipid, VolumeStatus::ForUpdate)
            .await?;
        let mut deleted = Vec::new();
        self.data_monitor
            .select_corrupted_objects(cached, &mut deleted, true)
            .await?;
        if recache {
            for object in &deleted {
                self.cache(&object.id, true, 0).await?;
            }
        }
        Ok(deleted)
    }

    /// Objects known to the cache belonging to a dataset, at or above the
    /// given volume status.
    pub async fn select_dataset_objects(
        &self,
        dsid: &str,
        min_status: VolumeStatus,
    ) -> CacheResult<Vec<CacheObject>> {
        Ok(self
            .cache
            .inventory()
            .select_objects_like_id(&format!("{dsid}/%"), min_status)
            .await?)
    }

    /// Copies and versions of one particular file of a dataset.
    pub async fn select_file_objects(
        &self,
        dsid: &str,
        filepath: &str,
        min_status: VolumeStatus,
    ) -> CacheResult<Vec<CacheObject>> {
        let inventory = self.cache.inventory();
        let exact = format!("{dsid}/{filepath}");
        let mut matched = inventory.select_objects_like_id(&exact, min_status).await?;
        let versioned = format!("{exact}#%");
        matched.extend(
            inventory
                .select_objects_like_id(&versioned, min_status)
                .await?,
        );
        Ok(matched)
    }

    /// Describe one object, or None if nothing matches at the given
    /// status.  Among multiple rows, the most recently added wins.
    pub async fn describe_object(
        &self,
        dsid: &str,
        filepath: &str,
        min_status: VolumeStatus,
    ) -> CacheResult<Option<CacheObject>> {
        let matched = self
            .cache
            .inventory()
            .select_objects_like_id(&format!("{dsid}/{filepath}"), min_status)
            .await?;
        Ok(matched.into_iter().max_by_key(|co| co.since))
    }

    /// Summarize one volume: its registration info plus usage totals.
    pub async fn summarize_volume(&self, name: &str) -> CacheResult<Value> {
        let inventory = self.cache.inventory();
        let info = inventory.get_volume_info(name).await?;
        let totals = inventory.get_volume_totals(name).await?;
        let mut out = serde_json::to_value(&info)
            .map_err(|e| CacheError::Management(format!("cannot serialize volume info: {e}")))?;
        let totals = serde_json::to_value(&totals)
            .map_err(|e| CacheError::Management(format!("cannot serialize volume totals: {e}")))?;
        if let (Value::Object(map), Value::Object(extra)) = (&mut out, totals) {
            map.extend(extra);
        }
        Ok(out)
    }

    /// Summaries for every registered volume.
    pub async fn summarize_volumes(&self) -> CacheResult<Vec<Value>> {
        let mut out = Vec::new();
        for name in self.cache.inventory().volumes().await? {
            out.push(self.summarize_volume(&name).await?);
        }
        Ok(out)
    }

    pub async fn summarize_dataset(&self, dsid: &str) -> CacheResult<DatasetSummary> {
        Ok(self.cache.inventory().summarize_dataset(dsid).await?)
    }

    pub async fn summarize_contents(
        &self,
        volume: Option<&str>,
    ) -> CacheResult<Vec<DatasetSummary>> {
        Ok(self.cache.inventory().summarize_contents(volume).await?)
    }

    /// The integrity monitor's status document, with the live `running`
    /// flag filled in.
    pub async fn monitor_status(&self) -> MonitorStatus {
        let mut status = self.status_file.read().await;
        status.running = self.monitor_running.load(Ordering::SeqCst);
        status
    }

    /// The caching queue's status: whether a worker is draining it, the
    /// item in process, and what is waiting.
    pub async fn caching_queue_status(&self) -> CacheResult<Value> {
        let waiting: Vec<String> = self
            .queue
            .load_queue()
            .await?
            .iter()
            .map(|e| e.aipid())
            .collect();
        Ok(json!({
            "status": if self.queue.is_running() { "running" } else { "not running" },
            "current": self.queue.inprocess(),
            "waiting": waiting,
        }))
    }

    fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.restore_locks.lock().expect("restore lock map poisoned");
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn prune_locks(&self) {
        let mut locks = self.restore_locks.lock().expect("restore lock map poisoned");
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[async_trait]
impl Placement for CacheManager {
    async fn cache(&self, id: &str, recache: bool, prefs: u32) -> CacheResult<CacheObject> {
        CacheManager::cache(self, id, recache, prefs).await
    }

    async fn cache_dataset(
        &self,
        dsid: &str,
        version: Option<&str>,
        recache: bool,
        prefs: u32,
        target: Option<&str>,
    ) -> CacheResult<BTreeSet<String>> {
        CacheManager::cache_dataset(self, dsid, version, recache, prefs, target).await
    }

    async fn is_cached(&self, id: &str) -> CacheResult<bool> {
        CacheManager::is_cached(self, id).await
    }

    async fn uncache(&self, id: &str) -> CacheResult<()> {
        CacheManager::uncache(self, id).await
    }
}
