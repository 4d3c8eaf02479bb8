//! Configuration types shared across crates.
//!
//! Only the types live here; loading them from files or the environment is
//! the embedding application's concern.

use crate::volume::VolumeStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the cache manager and its background workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory for administrative data: the monitor status document and
    /// the persistent caching queue.  Must already exist.
    pub admin_dir: PathBuf,
    /// Interval between monitor sweep starts, in seconds.
    #[serde(default = "default_duty_cycle_secs")]
    pub duty_cycle_secs: u64,
    /// Minimum age since an object's last check before it is rechecked,
    /// in seconds.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Offset from UTC midnight applied to sweep scheduling, in seconds.
    #[serde(default)]
    pub start_offset_secs: u64,
    /// How many objects one integrity-check batch selects.
    #[serde(default = "default_check_batch")]
    pub check_batch: usize,
    /// Objects at or below this size prefer small-object volumes.
    #[serde(default = "default_small_size_limit")]
    pub small_size_limit: i64,
    /// How long a nonzero refcount protects an object from eviction,
    /// in seconds.
    #[serde(default = "default_purge_protection_secs")]
    pub purge_protection_secs: u64,
    /// The cache volumes to register.
    pub volumes: Vec<VolumeConfig>,
}

/// Configuration for a single cache volume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// The volume's registered name.
    pub name: String,
    /// Root directory of the volume on local storage.
    pub root: PathBuf,
    /// Capacity in bytes.
    pub capacity: i64,
    /// Role bitmask (see [`crate::volume::roles`]).
    #[serde(default)]
    pub roles: u32,
    /// What the volume may be used for.
    #[serde(default)]
    pub status: VolumeStatus,
    /// Placement priority among eligible volumes; lower is tried first.
    #[serde(default)]
    pub priority: Option<i32>,
}

fn default_duty_cycle_secs() -> u64 {
    30 * 60
}

fn default_grace_period_secs() -> u64 {
    24 * 3600
}

fn default_check_batch() -> usize {
    100
}

fn default_small_size_limit() -> i64 {
    100_000_000
}

fn default_purge_protection_secs() -> u64 {
    24 * 3600
}

impl CacheConfig {
    pub fn duty_cycle(&self) -> Duration {
        Duration::from_secs(self.duty_cycle_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn start_offset(&self) -> Duration {
        Duration::from_secs(self.start_offset_secs)
    }
}
