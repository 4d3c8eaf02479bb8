//! Cache object descriptors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A record of one copy of an object held in a cache volume.
///
/// Mirrors a live inventory row.  The `metadata` blob is stored verbatim; a
/// handful of keys (`size`, `priority`, `checksum`, `checksumAlgorithm`,
/// `refcount`, `ediid`, `pdrid`) are lifted into first-class columns on
/// write and remain readable here through the typed accessors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheObject {
    /// The AIP identifier for the object.
    pub id: String,
    /// The name the object was given within its volume.
    pub name: String,
    /// The name of the volume holding this copy.
    pub volume: String,
    /// Size in bytes; [`crate::SIZE_UNKNOWN`] when not known.
    pub size: i64,
    /// Hex digest of the object's contents, when recorded.
    pub checksum: Option<String>,
    /// Name of the checksum algorithm.
    pub algorithm: String,
    /// Retention priority; lower is more important.
    pub priority: i32,
    /// Epoch ms when this copy was added or refreshed.
    pub since: i64,
    /// Epoch ms of the last integrity check; 0 if never checked.
    pub checked: i64,
    /// Application metadata, stored verbatim.
    pub metadata: Value,
}

impl CacheObject {
    /// Look up an integer metadatum, tolerating JSON numbers and strings.
    pub fn metadatum_i64(&self, key: &str) -> Option<i64> {
        match self.metadata.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Look up a string metadatum.
    pub fn metadatum_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// The number of outstanding references holding this copy in place.
    pub fn refcount(&self) -> i64 {
        self.metadatum_i64("refcount").unwrap_or(0)
    }
}
