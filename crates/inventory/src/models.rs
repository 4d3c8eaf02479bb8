//! Database row types mapping to the inventory schema.

use crate::error::{InventoryError, InventoryResult};
use larder_core::CacheObject;
use serde_json::Value;
use sqlx::FromRow;

/// An object row joined with its volume and algorithm names.
#[derive(Debug, Clone, FromRow)]
pub struct ObjectRecord {
    pub objid: String,
    pub name: String,
    pub volume: String,
    pub size: i64,
    pub checksum: Option<String>,
    pub algorithm: String,
    pub priority: i64,
    pub since: i64,
    pub checked: i64,
    pub metadata: Option<String>,
}

impl ObjectRecord {
    /// Convert to the domain descriptor, parsing the metadata blob.
    pub fn into_cache_object(self) -> InventoryResult<CacheObject> {
        let metadata = match &self.metadata {
            Some(text) => serde_json::from_str::<Value>(text)
                .map_err(|e| InventoryError::Metadata(format!("JSON parsing error: {e}")))?,
            None => Value::Object(Default::default()),
        };
        Ok(CacheObject {
            id: self.objid,
            name: self.name,
            volume: self.volume,
            size: self.size,
            checksum: self.checksum,
            algorithm: self.algorithm,
            priority: self.priority as i32,
            since: self.since,
            checked: self.checked,
            metadata,
        })
    }
}

/// A volume registration row.
#[derive(Debug, Clone, FromRow)]
pub struct VolumeRow {
    pub id: i64,
    pub name: String,
    pub priority: Option<i64>,
    pub capacity: Option<i64>,
    pub status: i64,
    pub metadata: Option<String>,
}

/// Aggregate row shared by volume totals and dataset summaries.
#[derive(Debug, Clone, FromRow)]
pub struct TotalsRow {
    pub filecount: i64,
    pub totalsize: i64,
    pub since: i64,
    pub checked: i64,
}
