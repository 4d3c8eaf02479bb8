//! Deletion planning: choosing and evicting victims to free space.

use crate::error::{CacheError, CacheResult};
use larder_core::CacheObject;
use larder_inventory::{InventoryMutator, InventoryReader, InventoryStore};
use larder_storage::{CacheVolume, StorageError};
use std::sync::Arc;

/// Selects eviction victims from a full volume.
///
/// Victims are taken least-important first (highest priority number),
/// breaking ties oldest and then largest first.  Planning is
/// sufficient-or-nothing: if the volume cannot yield the requested bytes,
/// an error is returned and nothing is deleted.
#[derive(Clone)]
pub struct DeletionPlanner {
    inventory: Arc<dyn InventoryStore>,
}

impl DeletionPlanner {
    pub fn new(inventory: Arc<dyn InventoryStore>) -> Self {
        Self { inventory }
    }

    /// Select a victim set from `volume` totalling at least `required_bytes`.
    pub async fn plan(
        &self,
        volume: &str,
        required_bytes: i64,
    ) -> CacheResult<Vec<CacheObject>> {
        if required_bytes <= 0 {
            return Ok(Vec::new());
        }
        let victims = self
            .inventory
            .select_objects_to_purge(volume, required_bytes)
            .await?;
        let total: i64 = victims.iter().map(|v| v.size.max(0)).sum();
        if total < required_bytes {
            return Err(CacheError::Management(format!(
                "volume {volume} cannot free {required_bytes} bytes: only {total} purgeable"
            )));
        }
        Ok(victims)
    }

    /// Evict a planned victim set, removing each from the volume and then
    /// the inventory.  Returns the bytes freed.
    pub async fn execute(
        &self,
        volume: &Arc<dyn CacheVolume>,
        victims: &[CacheObject],
    ) -> CacheResult<i64> {
        let mut freed: i64 = 0;
        for victim in victims {
            match volume.remove(&victim.name).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            self.inventory
                .remove_object(volume.name(), &victim.name)
                .await?;
            tracing::info!(
                volume = volume.name(),
                "evicted {} ({} bytes) to make room",
                victim.id,
                victim.size.max(0)
            );
            freed += victim.size.max(0);
        }
        Ok(freed)
    }
}
