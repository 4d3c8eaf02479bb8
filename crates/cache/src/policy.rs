//! Naming and preference policies.
//!
//! The manager composes these rather than being subclassed for them; the
//! PDR conventions below are the defaults.

use crate::error::{CacheError, CacheResult};
use larder_core::volume::roles;
use larder_core::AipId;

/// Maps an object id to the name it gets within a volume.
pub trait NamingPolicy: Send + Sync {
    /// Determine the in-volume name for an object destined for a volume
    /// with the given roles.
    fn name_for(&self, id: &str, roles: u32) -> CacheResult<String>;
}

/// Chooses placement preferences for an object.
pub trait PreferencePolicy: Send + Sync {
    /// An ANDed set of role preferences, or zero when none apply.
    fn preferences_for(&self, id: &str, size: i64) -> u32;
}

/// PDR naming: `dsid/filepath`, with superseded versions tucked under
/// `dsid/_v/version/filepath`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PdrNaming;

impl NamingPolicy for PdrNaming {
    fn name_for(&self, id: &str, _roles: u32) -> CacheResult<String> {
        let aip = AipId::parse(id)?;
        let filepath = aip.filepath().ok_or_else(|| {
            CacheError::Management(format!("dataset id names no file: {id}"))
        })?;
        Ok(match aip.version() {
            Some(v) => format!("{}/_v/{}/{}", aip.dsid(), v, filepath),
            None => format!("{}/{}", aip.dsid(), filepath),
        })
    }
}

/// PDR preferences: pinned versions go to old-version volumes; otherwise
/// placement follows the object's size.
#[derive(Clone, Copy, Debug)]
pub struct PdrPreferences {
    /// Objects at or below this size prefer small-object volumes.
    pub small_size_limit: i64,
}

impl Default for PdrPreferences {
    fn default() -> Self {
        Self {
            small_size_limit: 100_000_000,
        }
    }
}

impl PreferencePolicy for PdrPreferences {
    fn preferences_for(&self, id: &str, size: i64) -> u32 {
        let Ok(aip) = AipId::parse(id) else {
            return roles::GENERAL_PURPOSE;
        };
        if aip.version().is_some() {
            roles::OLD_VERSIONS
        } else if size >= 0 && size > self.small_size_limit {
            roles::LARGE_OBJECTS
        } else {
            roles::SMALL_OBJECTS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming_plain_and_versioned() {
        let naming = PdrNaming;
        assert_eq!(
            naming.name_for("mds2-2119/data/readme.txt", 0).unwrap(),
            "mds2-2119/data/readme.txt"
        );
        assert_eq!(
            naming.name_for("mds2-2119/data/readme.txt#1.0.2", 0).unwrap(),
            "mds2-2119/_v/1.0.2/data/readme.txt"
        );
        assert!(naming.name_for("mds2-2119", 0).is_err());
    }

    #[test]
    fn test_preferences_by_size_and_version() {
        let prefs = PdrPreferences {
            small_size_limit: 100,
        };
        assert_eq!(prefs.preferences_for("ds/a.txt", 50), roles::SMALL_OBJECTS);
        assert_eq!(prefs.preferences_for("ds/a.txt", 500), roles::LARGE_OBJECTS);
        assert_eq!(prefs.preferences_for("ds/a.txt", -1), roles::SMALL_OBJECTS);
        assert_eq!(prefs.preferences_for("ds/a.txt#2", 500), roles::OLD_VERSIONS);
    }
}
