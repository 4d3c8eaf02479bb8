//! The cache proper: a set of registered volumes plus their inventory.

use crate::error::{CacheError, CacheResult};
use crate::integrity::{CacheObjectCheck, IntegrityMonitor};
use crate::planner::DeletionPlanner;
use larder_core::{CacheObject, VolumeStatus};
use larder_inventory::{InventoryError, InventoryMutator, InventoryReader, InventoryStore};
use larder_storage::{CacheVolume, StorageError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

struct VolumeEntry {
    volume: Arc<dyn CacheVolume>,
    write_lock: Arc<Mutex<()>>,
}

/// A claim on space in one volume.  Holding it serializes writers on that
/// volume; drop it once the object is written and recorded.
pub struct Reservation {
    pub volume: Arc<dyn CacheVolume>,
    _guard: OwnedMutexGuard<()>,
}

impl Reservation {
    pub fn volume_name(&self) -> &str {
        self.volume.name()
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("volume", &self.volume.name())
            .finish()
    }
}

/// The registered volume set and the inventory recording what they hold.
///
/// Placement and space reservation live here; the richer caching contract
/// (restoration, queues, sweeps) is layered on top by the manager.
pub struct Cache {
    volumes: Vec<VolumeEntry>,
    inventory: Arc<dyn InventoryStore>,
    planner: DeletionPlanner,
}

impl Cache {
    pub fn new(inventory: Arc<dyn InventoryStore>) -> Self {
        let planner = DeletionPlanner::new(inventory.clone());
        Self {
            volumes: Vec::new(),
            inventory,
            planner,
        }
    }

    /// Attach a volume and register it in the inventory.  Registration is
    /// an upsert, so re-attaching updates capacity and roles.
    pub async fn add_volume(
        &mut self,
        volume: Arc<dyn CacheVolume>,
        capacity: i64,
        roles: u32,
        status: VolumeStatus,
        priority: Option<i32>,
    ) -> CacheResult<()> {
        let metadata = json!({
            "roles": roles,
            "status": status.as_int(),
            "priority": priority,
        });
        self.inventory
            .register_volume(volume.name(), capacity, Some(&metadata))
            .await?;
        self.volumes.push(VolumeEntry {
            volume,
            write_lock: Arc::new(Mutex::new(())),
        });
        Ok(())
    }

    pub fn inventory(&self) -> Arc<dyn InventoryStore> {
        self.inventory.clone()
    }

    pub fn planner(&self) -> &DeletionPlanner {
        &self.planner
    }

    /// Look up an attached volume by name.
    pub fn get_volume(&self, name: &str) -> Option<Arc<dyn CacheVolume>> {
        self.volumes
            .iter()
            .find(|e| e.volume.name() == name)
            .map(|e| e.volume.clone())
    }

    /// Names of the attached volumes, in registration order.
    pub fn volume_names(&self) -> Vec<String> {
        self.volumes
            .iter()
            .map(|e| e.volume.name().to_string())
            .collect()
    }

    /// The role bitmask a volume was registered with.
    pub async fn volume_roles(&self, name: &str) -> CacheResult<u32> {
        Ok(self.inventory.get_volume_info(name).await?.roles)
    }

    /// Unused capacity of a volume per the inventory's accounting; volumes
    /// registered without a capacity are treated as unbounded.
    pub async fn free_space(&self, name: &str) -> CacheResult<i64> {
        let info = self.inventory.get_volume_info(name).await?;
        match info.capacity {
            Some(capacity) => {
                let totals = self.inventory.get_volume_totals(name).await?;
                Ok(capacity - totals.totalsize)
            }
            None => Ok(i64::MAX),
        }
    }

    /// Find the best live, readable copy of an object: the most recently
    /// added copy on a volume open for reading.
    pub async fn find_cached(&self, id: &str) -> CacheResult<Option<CacheObject>> {
        let copies = self.inventory.find_object(id, None).await?;
        let mut best: Option<CacheObject> = None;
        for copy in copies {
            let info = match self.inventory.get_volume_info(&copy.volume).await {
                Ok(info) => info,
                Err(InventoryError::VolumeNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            if info.status < VolumeStatus::ForGet {
                continue;
            }
            if best.as_ref().map(|b| copy.since > b.since).unwrap_or(true) {
                best = Some(copy);
            }
        }
        Ok(best)
    }

    /// True when at least one readable copy exists.
    pub async fn is_cached(&self, id: &str) -> CacheResult<bool> {
        Ok(self.find_cached(id).await?.is_some())
    }

    /// Remove every live copy of an object from the volumes and the
    /// inventory.
    pub async fn uncache(&self, id: &str) -> CacheResult<()> {
        for copy in self.inventory.find_object(id, None).await? {
            if let Some(volume) = self.get_volume(&copy.volume) {
                match volume.remove(&copy.name).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.inventory.remove_object(&copy.volume, &copy.name).await?;
        }
        Ok(())
    }

    /// Reserve room for an object of the given size, preferring volumes
    /// whose roles match `prefs` (zero means no preference).  A full volume
    /// is asked to give up victims via deletion planning before the next
    /// candidate is tried.
    pub async fn reserve_space(&self, size: i64, prefs: u32) -> CacheResult<Reservation> {
        self.reserve_space_excluding(size, prefs, None).await
    }

    /// As [`Self::reserve_space`], skipping one named volume.  Used when a
    /// write on that volume just failed and an alternative is wanted.
    pub async fn reserve_space_excluding(
        &self,
        size: i64,
        prefs: u32,
        exclude: Option<&str>,
    ) -> CacheResult<Reservation> {
        let need = size.max(0);
        for (volume, lock) in self.eligible_volumes(prefs, exclude).await? {
            let guard = lock.lock_owned().await;
            let free = self.free_space(volume.name()).await?;
            if free >= need {
                return Ok(Reservation {
                    volume,
                    _guard: guard,
                });
            }
            match self.planner.plan(volume.name(), need - free).await {
                Ok(victims) => {
                    self.planner.execute(&volume, &victims).await?;
                    return Ok(Reservation {
                        volume,
                        _guard: guard,
                    });
                }
                Err(e) => {
                    tracing::debug!(
                        volume = volume.name(),
                        "cannot make room here: {e}; trying next volume"
                    );
                }
            }
        }
        Err(CacheError::VolumeNotAvailable { size, prefs })
    }

    /// Reserve room on one specific volume, planning deletions as needed.
    pub async fn reserve_space_on(&self, name: &str, size: i64) -> CacheResult<Reservation> {
        let entry = self
            .volumes
            .iter()
            .find(|e| e.volume.name() == name)
            .ok_or_else(|| CacheError::Management(format!("no attached volume named {name}")))?;
        let volume = entry.volume.clone();
        let guard = entry.write_lock.clone().lock_owned().await;

        let need = size.max(0);
        let free = self.free_space(name).await?;
        if free < need {
            let victims = self.planner.plan(name, need - free).await?;
            self.planner.execute(&volume, &victims).await?;
        }
        Ok(Reservation {
            volume,
            _guard: guard,
        })
    }

    /// Build an integrity monitor over this cache's volumes and inventory.
    pub fn integrity_monitor(
        &self,
        label: impl Into<String>,
        checks: Vec<Arc<dyn CacheObjectCheck>>,
    ) -> IntegrityMonitor {
        let volumes: HashMap<String, Arc<dyn CacheVolume>> = self
            .volumes
            .iter()
            .map(|e| (e.volume.name().to_string(), e.volume.clone()))
            .collect();
        IntegrityMonitor::new(label, self.inventory.clone(), volumes, checks)
    }

    /// Candidate volumes for placement: open for update, role-matching
    /// volumes first, then by registered priority.
    async fn eligible_volumes(
        &self,
        prefs: u32,
        exclude: Option<&str>,
    ) -> CacheResult<Vec<(Arc<dyn CacheVolume>, Arc<Mutex<()>>)>> {
        let mut scored = Vec::new();
        for entry in &self.volumes {
            let name = entry.volume.name();
            if exclude == Some(name) {
                continue;
            }
            let info = self.inventory.get_volume_info(name).await?;
            if info.status < VolumeStatus::ForUpdate {
                continue;
            }
            let role_match = prefs == 0 || (info.roles & prefs) != 0;
            scored.push((
                role_match,
                info.priority.unwrap_or(i64::MAX),
                entry.volume.clone(),
                entry.write_lock.clone(),
            ));
        }
        // matching roles first, then lowest priority number; the sort is
        // stable so registration order breaks remaining ties
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        Ok(scored.into_iter().map(|(_, _, v, l)| (v, l)).collect())
    }
}
