//! Integrity checks and the sweep monitor.

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use futures::StreamExt;
use larder_core::{clock, CacheObject, Sha256Digest, DEFAULT_ALGORITHM};
use larder_inventory::{InventoryMutator, InventoryReader, InventoryStore};
use larder_storage::{CacheVolume, StorageError};
use std::collections::HashMap;
use std::sync::Arc;

/// The result of applying one check to one cached object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    Pass,
    /// The object is corrupt or unverifiable and should be deleted.
    Fail(String),
}

/// A single integrity test applicable to a cached object.
///
/// Returning `Err` signals infrastructure trouble (the check could not be
/// run); a corrupt object is reported through [`CheckOutcome::Fail`].
#[async_trait]
pub trait CacheObjectCheck: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(
        &self,
        object: &CacheObject,
        volume: &dyn CacheVolume,
    ) -> CacheResult<CheckOutcome>;
}

/// Recomputes the stored bytes' SHA-256 digest and compares it with the
/// recorded checksum.  An object with no recorded checksum, an unsupported
/// algorithm, or missing bytes is unverifiable and fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChecksumSha256Check;

#[async_trait]
impl CacheObjectCheck for ChecksumSha256Check {
    fn name(&self) -> &'static str {
        "checksum-sha256"
    }

    async fn check(
        &self,
        object: &CacheObject,
        volume: &dyn CacheVolume,
    ) -> CacheResult<CheckOutcome> {
        let Some(expected) = object.checksum.as_deref() else {
            return Ok(CheckOutcome::Fail("no recorded checksum".to_string()));
        };
        if object.algorithm != DEFAULT_ALGORITHM {
            return Ok(CheckOutcome::Fail(format!(
                "unsupported checksum algorithm: {}",
                object.algorithm
            )));
        }

        let mut stream = match volume.get_stream(&object.name).await {
            Ok(stream) => stream,
            Err(StorageError::NotFound(_)) => {
                return Ok(CheckOutcome::Fail("stored bytes are missing".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut hasher = Sha256Digest::hasher();
        let mut size: i64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(CacheError::Volume)?;
            size += chunk.len() as i64;
            hasher.update(&chunk);
        }
        let actual = hasher.finalize().to_hex();

        if object.size >= 0 && size != object.size {
            return Ok(CheckOutcome::Fail(format!(
                "size changed: recorded {}, found {size}",
                object.size
            )));
        }
        if !actual.eq_ignore_ascii_case(expected) {
            return Ok(CheckOutcome::Fail(format!(
                "checksum mismatch: recorded {expected}, computed {actual}"
            )));
        }
        Ok(CheckOutcome::Pass)
    }
}

/// Applies a list of checks to batches of cached objects, deleting the
/// failures from both the volume and the inventory.
#[derive(Clone)]
pub struct IntegrityMonitor {
    label: String,
    inventory: Arc<dyn InventoryStore>,
    volumes: HashMap<String, Arc<dyn CacheVolume>>,
    checks: Vec<Arc<dyn CacheObjectCheck>>,
}

impl IntegrityMonitor {
    pub(crate) fn new(
        label: impl Into<String>,
        inventory: Arc<dyn InventoryStore>,
        volumes: HashMap<String, Arc<dyn CacheVolume>>,
        checks: Vec<Arc<dyn CacheObjectCheck>>,
    ) -> Self {
        Self {
            label: label.into(),
            inventory,
            volumes,
            checks,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn inventory(&self) -> &Arc<dyn InventoryStore> {
        &self.inventory
    }

    /// Select up to `max` objects due for a check and run the checks on
    /// them.  Failures are deleted and appended to `deleted`; passes get
    /// their `checked` timestamp advanced when `update_status` is set.
    /// Returns the number of objects examined; zero means nothing is due.
    pub async fn find_corrupted_objects(
        &self,
        max: usize,
        deleted: &mut Vec<CacheObject>,
        update_status: bool,
    ) -> CacheResult<usize> {
        let due = self.inventory.select_due_for_check(None, max).await?;
        self.select_corrupted_objects(due, deleted, update_status).await
    }

    /// Run the checks over a caller-selected list of objects.
    pub async fn select_corrupted_objects(
        &self,
        objects: Vec<CacheObject>,
        deleted: &mut Vec<CacheObject>,
        update_status: bool,
    ) -> CacheResult<usize> {
        let mut examined = 0;
        for object in objects {
            examined += 1;
            let Some(volume) = self.volumes.get(&object.volume) else {
                tracing::warn!(
                    monitor = %self.label,
                    "inventory row for {} names unattached volume {}; skipping",
                    object.id,
                    object.volume
                );
                // advance the timestamp anyway so the sweep can drain
                if update_status {
                    self.inventory
                        .update_checked(&object.volume, &object.name, clock::now_ms())
                        .await?;
                }
                continue;
            };

            match self.run_checks(&object, volume.as_ref()).await? {
                CheckOutcome::Pass => {
                    if update_status {
                        self.inventory
                            .update_checked(&object.volume, &object.name, clock::now_ms())
                            .await?;
                    }
                }
                CheckOutcome::Fail(reason) => {
                    tracing::warn!(
                        monitor = %self.label,
                        "integrity failure on {} in volume {}: {reason}; deleting",
                        object.id,
                        object.volume
                    );
                    match volume.remove(&object.name).await {
                        Ok(()) | Err(StorageError::NotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                    self.inventory
                        .remove_object(&object.volume, &object.name)
                        .await?;
                    deleted.push(object);
                }
            }
        }
        Ok(examined)
    }

    /// Run each configured check in order, stopping at the first failure.
    async fn run_checks(
        &self,
        object: &CacheObject,
        volume: &dyn CacheVolume,
    ) -> CacheResult<CheckOutcome> {
        for check in &self.checks {
            if let CheckOutcome::Fail(reason) = check.check(object, volume).await? {
                return Ok(CheckOutcome::Fail(format!("{}: {reason}", check.name())));
            }
        }
        Ok(CheckOutcome::Pass)
    }
}
