//! Storage inventory database for the Larder data cache.
//!
//! The inventory is the sole persistent state of the cache: a relational
//! record of every object held on a cache volume, the volume it lives in,
//! its size, checksum, priority class, and last-check timestamp.  Placement,
//! eviction, and integrity-sweep decisions are all answered from here.
//!
//! The store is split into two capability traits so that consumers receive
//! only what they need:
//! - [`InventoryReader`]: placement/eviction/status queries
//! - [`InventoryMutator`]: registrations and object lifecycle writes
//!
//! [`SqliteInventory`] implements both over an embedded SQLite database.

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{InventoryError, InventoryResult};
pub use repos::{
    DatasetSummary, InventoryMutator, InventoryReader, InventoryStore, VolumeInfo, VolumeTotals,
};
pub use store::SqliteInventory;
