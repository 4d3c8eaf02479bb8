//! Core domain types shared across the Larder cache workspace.
//!
//! This crate defines the canonical data model used by the inventory,
//! storage, and cache-manager crates:
//! - AIP identifiers (`dsid[/filepath][#version]`)
//! - Content checksums and incremental hashing
//! - Cache object descriptors and lifted metadata keys
//! - Volume status levels and role bitmasks
//! - Dataset manifests (the head bag's file listing)
//! - Configuration types

pub mod aip;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod error;
pub mod manifest;
pub mod object;
pub mod volume;

pub use aip::AipId;
pub use checksum::{Sha256Digest, Sha256Hasher};
pub use error::{Error, Result};
pub use manifest::{DatasetManifest, ManifestFile};
pub use object::CacheObject;
pub use volume::VolumeStatus;

/// Default priority assigned to cached objects; lower means more important.
pub const DEFAULT_PRIORITY: i32 = 10;

/// The checksum algorithm registered by default in every inventory.
pub const DEFAULT_ALGORITHM: &str = "sha256";

/// Size recorded for an object when its true size is unknown.
pub const SIZE_UNKNOWN: i64 = -1;
