//! Volume status levels and role bitmasks.

use serde::{Deserialize, Serialize};

/// What a cache volume may currently be used for.
///
/// Statuses are strictly increasing in capability: a volume that can be
/// updated can also serve reads, and a readable volume can serve metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    /// The volume may not be used at all.
    NotAvailable,
    /// Metadata about the volume's holdings may be queried, but not bytes.
    ForInfo,
    /// Object bytes may be read back.
    ForGet,
    /// Objects may be added, removed, or have their records updated.
    ForUpdate,
}

impl VolumeStatus {
    pub fn as_int(self) -> i64 {
        match self {
            Self::NotAvailable => 0,
            Self::ForInfo => 1,
            Self::ForGet => 2,
            Self::ForUpdate => 3,
        }
    }

    /// Decode a stored status; out-of-range values collapse to unavailable.
    pub fn from_int(v: i64) -> Self {
        match v {
            1 => Self::ForInfo,
            2 => Self::ForGet,
            3 => Self::ForUpdate,
            _ => Self::NotAvailable,
        }
    }
}

impl Default for VolumeStatus {
    fn default() -> Self {
        Self::ForUpdate
    }
}

/// Role bits describing what kind of content a volume is intended to hold.
/// Caching preferences use the same bitmask.
pub mod roles {
    /// No particular specialization.
    pub const GENERAL_PURPOSE: u32 = 1;
    /// Tuned for many small objects.
    pub const SMALL_OBJECTS: u32 = 2;
    /// Tuned for large objects.
    pub const LARGE_OBJECTS: u32 = 4;
    /// Holds superseded versions of objects.
    pub const OLD_VERSIONS: u32 = 8;
    /// Backed by fast media.
    pub const FAST_ACCESS: u32 = 16;
    /// Restricted-access content only.
    pub const RESTRICTED_DATA: u32 = 32;
}
