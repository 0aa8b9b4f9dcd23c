use crate::registry::reference::Digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Cached manifest for one (group, image, tag).
/// The payload itself is stored content-addressed under `digest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub group: String,
    pub image: String,
    pub tag: String,
    pub digest: Digest,
    pub content_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cached blob for one (group, image, digest). Never updated once written.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobRecord {
    pub group: String,
    pub image: String,
    pub digest: Digest,
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub manifests: usize,
    pub blobs: usize,
    pub blob_bytes: u64,
}

/// Where a served response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Served from cache without transferring the body from upstream
    Hit,
    /// Fetched from upstream and stored
    Miss,
    /// Upstream unreachable; last known cached copy served
    Stale,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::Hit => "HIT",
            CacheSource::Miss => "MISS",
            CacheSource::Stale => "STALE",
        }
    }
}
