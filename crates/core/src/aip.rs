//! AIP identifiers of the form `dsid[/filepath][#version]`.
//!
//! The `dsid` portion is either a legacy EDI identifier or the local part of
//! a PDR ARK identifier (e.g. `mds2-2119`).  An identifier without a
//! filepath names a whole dataset; with one, a single file within it.  The
//! optional `#version` suffix pins a particular released version.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A parsed AIP identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AipId {
    dsid: String,
    filepath: Option<String>,
    version: Option<String>,
}

impl AipId {
    /// Parse an identifier string.
    ///
    /// An empty filepath (`"mds2-2119/"`) is treated as a dataset reference,
    /// matching how queue entries round-trip dataset ids.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let (head, version) = match s.split_once('#') {
            Some((head, v)) if !v.is_empty() => (head, Some(v.to_string())),
            Some((head, _)) => (head, None),
            None => (s, None),
        };

        let (dsid, filepath) = match head.split_once('/') {
            Some((dsid, f)) if !f.is_empty() => (dsid, Some(f.to_string())),
            Some((dsid, _)) => (dsid, None),
            None => (head, None),
        };

        if dsid.is_empty() {
            return Err(crate::Error::InvalidId(format!("empty dataset id: {s:?}")));
        }
        if !dsid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(crate::Error::InvalidId(format!(
                "illegal character in dataset id: {dsid:?}"
            )));
        }
        if let Some(f) = &filepath {
            if f.starts_with('/') || f.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
                return Err(crate::Error::InvalidId(format!("illegal filepath: {f:?}")));
            }
        }

        Ok(Self {
            dsid: dsid.to_string(),
            filepath,
            version,
        })
    }

    /// Build an identifier for a whole dataset.
    pub fn for_dataset(dsid: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            dsid: dsid.into(),
            filepath: None,
            version: version.map(str::to_string),
        }
    }

    /// Build an identifier for a file within a dataset.
    pub fn for_file(dsid: impl Into<String>, filepath: impl Into<String>) -> Self {
        Self {
            dsid: dsid.into(),
            filepath: Some(filepath.into()),
            version: None,
        }
    }

    pub fn dsid(&self) -> &str {
        &self.dsid
    }

    pub fn filepath(&self) -> Option<&str> {
        self.filepath.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// True when the identifier names a whole dataset rather than one file.
    pub fn is_dataset(&self) -> bool {
        self.filepath.is_none()
    }

    /// The SQL-LIKE pattern matching every member of this id's dataset.
    pub fn dataset_pattern(&self) -> String {
        format!("{}/%", self.dsid)
    }

    /// The identifier with any version suffix dropped.
    pub fn unversioned(&self) -> Self {
        Self {
            dsid: self.dsid.clone(),
            filepath: self.filepath.clone(),
            version: None,
        }
    }
}

impl fmt::Display for AipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dsid)?;
        if let Some(p) = &self.filepath {
            write!(f, "/{p}")?;
        }
        if let Some(v) = &self.version {
            write!(f, "#{v}")?;
        }
        Ok(())
    }
}

impl FromStr for AipId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dataset_only() {
        let id = AipId::parse("mds2-2119").unwrap();
        assert_eq!(id.dsid(), "mds2-2119");
        assert!(id.is_dataset());
        assert_eq!(id.version(), None);
    }

    #[test]
    fn test_parse_file_and_version() {
        let id = AipId::parse("mds2-2119/data/readme.txt#1.0.2").unwrap();
        assert_eq!(id.dsid(), "mds2-2119");
        assert_eq!(id.filepath(), Some("data/readme.txt"));
        assert_eq!(id.version(), Some("1.0.2"));
        assert!(!id.is_dataset());
    }

    #[test]
    fn test_parse_versioned_dataset() {
        let id = AipId::parse("mds2-2119#1.0.0").unwrap();
        assert!(id.is_dataset());
        assert_eq!(id.version(), Some("1.0.0"));
    }

    #[test]
    fn test_display_roundtrip() {
        for s in ["mds2-2119", "mds2-2119/a/b.txt", "mds2-2119/a.txt#2", "ark-88434#3"] {
            assert_eq!(AipId::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_trailing_slash_is_dataset() {
        let id = AipId::parse("mds2-2119/").unwrap();
        assert!(id.is_dataset());
    }

    #[test]
    fn test_rejects_bad_ids() {
        assert!(AipId::parse("").is_err());
        assert!(AipId::parse("/readme.txt").is_err());
        assert!(AipId::parse("ds id").is_err());
        assert!(AipId::parse("mds2-2119/../etc/passwd").is_err());
        assert!(AipId::parse("mds2-2119//x").is_err());
    }
}
