//! Inventory capability traits and query result types.
//!
//! The reader/mutator split is deliberate: the cache manager's workers and
//! the restorer are handed these interfaces rather than the manager itself,
//! which keeps the dependency graph acyclic.

use crate::error::InventoryResult;
use async_trait::async_trait;
use larder_core::{CacheObject, VolumeStatus};
use serde::Serialize;
use serde_json::Value;

/// Registration info for one cache volume.
#[derive(Clone, Debug, Serialize)]
pub struct VolumeInfo {
    pub name: String,
    pub capacity: Option<i64>,
    pub priority: Option<i64>,
    pub status: VolumeStatus,
    /// Role bitmask lifted from the volume metadata.
    pub roles: u32,
    /// The registration metadata, stored verbatim.
    pub metadata: Value,
}

/// Aggregates over the live rows of one volume.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeTotals {
    pub filecount: i64,
    pub totalsize: i64,
    /// Epoch ms of the newest addition; 0 when the volume is empty.
    pub since: i64,
    pub since_date: String,
    /// Epoch ms of the stalest integrity check; 0 when never checked.
    pub checked: i64,
    pub checked_date: String,
}

/// Aggregates over the cached files of one dataset.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSummary {
    pub aipid: String,
    pub filecount: i64,
    pub totalsize: i64,
    pub since: i64,
    pub since_date: String,
    pub checked: i64,
    pub checked_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ediid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdrid: Option<String>,
}

/// Read-side inventory capability.
#[async_trait]
pub trait InventoryReader: Send + Sync {
    /// Return all live copies of an object, optionally restricted to one
    /// volume.  Typically at most one element per volume.
    async fn find_object(
        &self,
        id: &str,
        volume: Option<&str>,
    ) -> InventoryResult<Vec<CacheObject>>;

    /// Return live objects whose id matches a SQL-LIKE pattern, restricted
    /// to volumes at or above the given status.
    async fn select_objects_like_id(
        &self,
        pattern: &str,
        min_status: VolumeStatus,
    ) -> InventoryResult<Vec<CacheObject>>;

    /// Return up to `max` objects whose last check is older than the
    /// configured grace period, stalest first.  Only objects on volumes
    /// open for update are eligible.
    async fn select_due_for_check(
        &self,
        volume: Option<&str>,
        max: usize,
    ) -> InventoryResult<Vec<CacheObject>>;

    /// Return eviction candidates from one volume whose total size is at
    /// least `required_bytes`: least-important first (priority descending),
    /// breaking ties oldest-then-largest.  Protected objects (nonzero
    /// refcount within the protection window, or on volumes not open for
    /// update) are excluded.  The returned set may fall short when the
    /// volume simply does not hold enough unprotected bytes.
    async fn select_objects_to_purge(
        &self,
        volume: &str,
        required_bytes: i64,
    ) -> InventoryResult<Vec<CacheObject>>;

    /// Return a volume's registration info.
    async fn get_volume_info(&self, name: &str) -> InventoryResult<VolumeInfo>;

    /// Return aggregates over a volume's live rows.
    async fn get_volume_totals(&self, name: &str) -> InventoryResult<VolumeTotals>;

    /// The names of all registered volumes.
    async fn volumes(&self) -> InventoryResult<Vec<String>>;

    /// The names of all registered checksum algorithms.
    async fn checksum_algorithms(&self) -> InventoryResult<Vec<String>>;

    /// Summarize the cached files of one dataset.
    async fn summarize_dataset(&self, dsid: &str) -> InventoryResult<DatasetSummary>;

    /// Summarize the cache contents per dataset, optionally restricted to
    /// one volume.
    async fn summarize_contents(
        &self,
        volume: Option<&str>,
    ) -> InventoryResult<Vec<DatasetSummary>>;
}

/// Write-side inventory capability.
#[async_trait]
pub trait InventoryMutator: Send + Sync {
    /// Record the addition of an object to a volume and return its
    /// descriptor.  Idempotent at `(volume, name)`: any prior rows at that
    /// coordinate are removed in the same transaction.  The keys `size`,
    /// `checksum`, `checksumAlgorithm`, and `priority` are lifted out of
    /// `metadata` into their columns; the blob itself is stored verbatim.
    async fn add_object(
        &self,
        id: &str,
        volume: &str,
        name: &str,
        metadata: Option<&Value>,
    ) -> InventoryResult<CacheObject>;

    /// Delete the row(s) at `(volume, name)`.
    async fn remove_object(&self, volume: &str, name: &str) -> InventoryResult<()>;

    /// Advance an object's last-check timestamp.
    async fn update_checked(&self, volume: &str, name: &str, when_ms: i64)
        -> InventoryResult<()>;

    /// Make a checksum algorithm known to the inventory; a no-op when it
    /// already is.
    async fn register_algorithm(&self, name: &str) -> InventoryResult<()>;

    /// Register a cache volume or update an existing registration.  The
    /// keys `priority`, `status`, and `roles` are lifted from `metadata`.
    async fn register_volume(
        &self,
        name: &str,
        capacity: i64,
        metadata: Option<&Value>,
    ) -> InventoryResult<()>;

    /// Set the minimum age since last check before an object is due again.
    fn set_check_grace_period(&self, ms: i64);

    /// Set how long a nonzero refcount protects an object from eviction.
    fn set_purge_protection_ttl(&self, ms: i64);
}

/// Combined inventory store.
#[async_trait]
pub trait InventoryStore: InventoryReader + InventoryMutator {
    /// Apply the schema.
    async fn migrate(&self) -> InventoryResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> InventoryResult<()>;
}
