use crate::cache::metadata::{BlobRecord, CacheStats, ManifestRecord};
use crate::error::{DependencyProxyError, Result};
use crate::registry::reference::Digest;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};

/// Maps a blob key to the sender that will publish the outcome of its download.
type DownloadGuard = Arc<Mutex<HashMap<String, broadcast::Sender<Result<BlobRecord>>>>>;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temp file next to its final path. Removed on drop unless committed,
/// so failed, mismatched or cancelled writes never leave partial data behind.
struct TempFile {
    path: PathBuf,
    committed: bool,
}

impl TempFile {
    fn beside(target: &Path) -> Self {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("entry");
        Self {
            path: target.with_file_name(format!("{}.{}-{}.tmp", name, std::process::id(), n)),
            committed: false,
        }
    }

    async fn commit(mut self, target: &Path) -> Result<()> {
        fs::rename(&self.path, target).await.map_err(|e| {
            DependencyProxyError::Cache(format!("Failed to rename {}: {}", target.display(), e))
        })?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// On-disk cache of manifests and blobs, partitioned by group.
///
/// Layout:
/// - `groups/{group}/manifests/{image}/tags/{tag}.json`   tag record (upserted)
/// - `groups/{group}/manifests/{image}/sha256/{hex}`      manifest payload
/// - `groups/{group}/blobs/{image}/sha256/{hex}`          blob payload (write-once)
pub struct CacheStorage {
    base_dir: PathBuf,
    groups_dir: PathBuf,
    /// Tracks in-flight blob downloads so concurrent misses share one upstream fetch
    in_flight: DownloadGuard,
}

impl CacheStorage {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let groups_dir = base_dir.join("groups");
        std::fs::create_dir_all(&groups_dir)
            .map_err(|e| DependencyProxyError::Cache(format!("Failed to create cache dir: {}", e)))?;

        Ok(Self {
            base_dir,
            groups_dir,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn manifests_dir(&self, group: &str, image: &str) -> PathBuf {
        self.groups_dir.join(group).join("manifests").join(image)
    }

    /// Path of the tag record for (group, image, tag)
    pub fn manifest_record_path(&self, group: &str, image: &str, tag: &str) -> PathBuf {
        let tag_safe = tag.replace(':', "_");
        self.manifests_dir(group, image)
            .join("tags")
            .join(format!("{}.json", tag_safe))
    }

    /// Path of a manifest payload by digest
    pub fn manifest_payload_path(&self, group: &str, image: &str, digest: &Digest) -> PathBuf {
        self.manifests_dir(group, image)
            .join("sha256")
            .join(digest.hex())
    }

    /// Path of a blob payload by digest
    pub fn blob_path(&self, group: &str, image: &str, digest: &Digest) -> PathBuf {
        self.groups_dir
            .join(group)
            .join("blobs")
            .join(image)
            .join("sha256")
            .join(digest.hex())
    }

    /// Read the cached manifest for (group, image, tag).
    ///
    /// Returns `None` on a miss, and also when the stored payload no longer
    /// hashes to the recorded digest.
    pub async fn read_manifest(
        &self,
        group: &str,
        image: &str,
        tag: &str,
    ) -> Result<Option<(ManifestRecord, Bytes)>> {
        let record_path = self.manifest_record_path(group, image, tag);
        let raw = match fs::read(&record_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DependencyProxyError::Cache(format!(
                    "Failed to read manifest record {}: {}",
                    record_path.display(),
                    e
                )))
            }
        };

        let record: ManifestRecord = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    group = %group,
                    image = %image,
                    tag = %tag,
                    error = %e,
                    "Unreadable manifest record - treating as cache miss"
                );
                return Ok(None);
            }
        };

        let payload_path = self.manifest_payload_path(group, image, &record.digest);
        let payload = match fs::read(&payload_path).await {
            Ok(payload) => payload,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    group = %group,
                    image = %image,
                    tag = %tag,
                    digest = %record.digest,
                    "Manifest record points at missing payload"
                );
                return Ok(None);
            }
            Err(e) => {
                return Err(DependencyProxyError::Cache(format!(
                    "Failed to read manifest {}: {}",
                    payload_path.display(),
                    e
                )))
            }
        };

        let actual = Digest::of(&payload);
        if actual != record.digest {
            tracing::error!(
                group = %group,
                image = %image,
                tag = %tag,
                expected = %record.digest,
                actual = %actual,
                "Cached manifest payload is corrupt - ignoring it"
            );
            return Ok(None);
        }

        Ok(Some((record, Bytes::from(payload))))
    }

    /// Upsert the manifest for (group, image, tag).
    ///
    /// The payload must hash to `digest`; a mismatching payload is rejected
    /// before anything touches the disk.
    pub async fn write_manifest(
        &self,
        group: &str,
        image: &str,
        tag: &str,
        digest: &Digest,
        content_type: &str,
        data: &[u8],
    ) -> Result<ManifestRecord> {
        let actual = Digest::of(data);
        if &actual != digest {
            return Err(DependencyProxyError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        let payload_path = self.manifest_payload_path(group, image, digest);
        if !fs::try_exists(&payload_path).await.unwrap_or(false) {
            write_atomic(&payload_path, data).await?;
        }

        let record_path = self.manifest_record_path(group, image, tag);
        let now = Utc::now();
        let created_at = match self.read_manifest_record(&record_path).await {
            Some(existing) => existing.created_at,
            None => now,
        };

        let record = ManifestRecord {
            group: group.to_string(),
            image: image.to_string(),
            tag: tag.to_string(),
            digest: digest.clone(),
            content_type: content_type.to_string(),
            size: data.len() as u64,
            created_at,
            updated_at: now,
        };
        write_atomic(&record_path, &serde_json::to_vec_pretty(&record)?).await?;

        tracing::debug!(
            group = %group,
            image = %image,
            tag = %tag,
            digest = %digest,
            size = record.size,
            "Manifest record upserted"
        );

        Ok(record)
    }

    async fn read_manifest_record(&self, path: &Path) -> Option<ManifestRecord> {
        let raw = fs::read(path).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Look up a cached blob
    pub async fn blob(&self, group: &str, image: &str, digest: &Digest) -> Result<Option<BlobRecord>> {
        let path = self.blob_path(group, image, digest);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(BlobRecord {
                group: group.to_string(),
                image: image.to_string(),
                digest: digest.clone(),
                size: metadata.len(),
                path,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DependencyProxyError::Cache(format!(
                "Failed to stat blob {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Stream a blob into the cache, hashing as it is written.
    ///
    /// The file only becomes visible under its digest once the computed hash
    /// matches. If another writer already stored the digest, the existing file
    /// is kept.
    pub async fn write_blob_stream<S>(
        &self,
        group: &str,
        image: &str,
        digest: &Digest,
        mut stream: S,
    ) -> Result<BlobRecord>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let path = self.blob_path(group, image, digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                DependencyProxyError::Cache(format!("Failed to create blob dir: {}", e))
            })?;
        }

        let temp = TempFile::beside(&path);
        let mut file = fs::File::create(&temp.path)
            .await
            .map_err(|e| DependencyProxyError::Cache(format!("Failed to create blob file: {}", e)))?;

        let mut hasher = Sha256::new();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| DependencyProxyError::Cache(format!("Failed to write blob: {}", e)))?;
            written += chunk.len() as u64;
        }

        file.sync_all()
            .await
            .map_err(|e| DependencyProxyError::Cache(format!("Failed to sync blob: {}", e)))?;
        drop(file);

        let actual = Digest::from_hasher(hasher);
        if &actual != digest {
            tracing::error!(
                group = %group,
                image = %image,
                expected = %digest,
                actual = %actual,
                size = written,
                "Blob content does not match its digest - discarding"
            );
            return Err(DependencyProxyError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        if fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(
                group = %group,
                image = %image,
                digest = %digest,
                "Blob already stored by a concurrent writer"
            );
        } else {
            temp.commit(&path).await?;
        }

        Ok(BlobRecord {
            group: group.to_string(),
            image: image.to_string(),
            digest: digest.clone(),
            size: written,
            path,
        })
    }

    /// Store an in-memory blob; same verification as [`Self::write_blob_stream`]
    pub async fn write_blob(
        &self,
        group: &str,
        image: &str,
        digest: &Digest,
        data: &[u8],
    ) -> Result<BlobRecord> {
        let chunk = Bytes::copy_from_slice(data);
        self.write_blob_stream(group, image, digest, futures::stream::iter([Ok(chunk)]))
            .await
    }

    /// Run `download_fn` at most once per key at a time; concurrent callers
    /// for the same key wait for and share its outcome.
    pub async fn download_with_dedupe<F, Fut>(&self, key: &str, download_fn: F) -> Result<BlobRecord>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<BlobRecord>> + Send + 'static,
    {
        let mut rx = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.entry(key.to_string()) {
                std::collections::hash_map::Entry::Occupied(entry) => {
                    tracing::debug!(key = %key, "Waiting for in-flight download");
                    entry.get().subscribe()
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let (tx, rx) = broadcast::channel(1);
                    entry.insert(tx.clone());

                    // Runs detached: a dropped client connection does not abort the fetch,
                    // the result still lands in the cache.
                    let in_flight = self.in_flight.clone();
                    let key = key.to_string();
                    tokio::spawn(async move {
                        let result = download_fn().await;
                        in_flight.lock().await.remove(&key);
                        let _ = tx.send(result);
                    });
                    rx
                }
            }
        };

        rx.recv().await.map_err(|e| {
            DependencyProxyError::Cache(format!("Download channel error: {}", e))
        })?
    }

    /// Count tag records, blobs and blob bytes across all groups
    pub async fn stats(&self) -> Result<CacheStats> {
        let groups_dir = self.groups_dir.clone();
        tokio::task::spawn_blocking(move || {
            let mut stats = CacheStats::default();
            let groups = match std::fs::read_dir(&groups_dir) {
                Ok(groups) => groups,
                Err(_) => return stats,
            };
            for group in groups.flatten() {
                walk_files(&group.path().join("manifests"), &mut |path: &Path, _: &std::fs::Metadata| {
                    if path.extension().is_some_and(|ext| ext == "json") {
                        stats.manifests += 1;
                    }
                });
                walk_files(&group.path().join("blobs"), &mut |path: &Path, metadata: &std::fs::Metadata| {
                    if !path.extension().is_some_and(|ext| ext == "tmp") {
                        stats.blobs += 1;
                        stats.blob_bytes += metadata.len();
                    }
                });
            }
            stats
        })
        .await
        .map_err(|e| DependencyProxyError::Cache(format!("Stats task failed: {}", e)))
    }
}

fn walk_files(dir: &Path, visit: &mut dyn FnMut(&Path, &std::fs::Metadata)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            walk_files(&path, visit);
        } else if metadata.is_file() {
            visit(&path, &metadata);
        }
    }
}

/// Write to a temp file, sync, then rename over `path`
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            DependencyProxyError::Cache(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    let temp = TempFile::beside(path);
    let mut file = fs::File::create(&temp.path).await.map_err(|e| {
        DependencyProxyError::Cache(format!("Failed to create {}: {}", temp.path.display(), e))
    })?;
    file.write_all(data).await.map_err(|e| {
        DependencyProxyError::Cache(format!("Failed to write {}: {}", path.display(), e))
    })?;
    file.sync_all().await.map_err(|e| {
        DependencyProxyError::Cache(format!("Failed to sync {}: {}", path.display(), e))
    })?;
    drop(file);
    temp.commit(path).await
}
