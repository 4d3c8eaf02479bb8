//! Dataset manifests.
//!
//! A manifest enumerates the member files of one released version of a
//! dataset.  It is the content of the dataset's head bag and is what the
//! restorer consults to enumerate files for whole-dataset caching.

use serde::{Deserialize, Serialize};

/// One member file of a dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Path of the file below the dataset root.
    pub filepath: String,
    /// Size in bytes.
    pub size: i64,
    /// Hex SHA-256 digest of the file's contents.
    pub sha256: String,
}

/// The file listing for one version of a dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetManifest {
    /// The dataset's AIP id (EDI-ID or ARK local part).
    pub aipid: String,
    /// The released version this manifest describes; None for the latest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// The member files.
    pub files: Vec<ManifestFile>,
}

impl DatasetManifest {
    /// Parse a manifest from its JSON serialization.
    pub fn from_json(data: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(data).map_err(|e| crate::Error::Manifest(e.to_string()))
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| crate::Error::Manifest(e.to_string()))
    }

    /// Find a member file by its path.
    pub fn find_file(&self, filepath: &str) -> Option<&ManifestFile> {
        self.files.iter().find(|f| f.filepath == filepath)
    }

    /// Total size of all member files.
    pub fn total_size(&self) -> i64 {
        self.files.iter().map(|f| f.size.max(0)).sum()
    }
}
