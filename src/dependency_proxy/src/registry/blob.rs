use crate::cache::{BlobRecord, CacheSource, CacheStorage};
use crate::error::Result;
use crate::registry::reference::Digest;
use crate::registry::upstream::UpstreamClient;
use std::sync::Arc;

/// A blob ready to be streamed from the cache directory
#[derive(Debug, Clone)]
pub struct ResolvedBlob {
    pub record: BlobRecord,
    pub source: CacheSource,
}

/// Resolves (group, image, digest) to a cached blob.
///
/// Blobs are immutable, so a cached entry is served without any upstream
/// call. A miss fetches once (concurrent misses share the fetch), verifies
/// the digest while streaming to disk, and only then publishes the file.
/// There is no stale fallback: a miss during an outage fails.
pub struct BlobCache {
    storage: Arc<CacheStorage>,
    upstream: Arc<UpstreamClient>,
}

impl BlobCache {
    pub fn new(storage: Arc<CacheStorage>, upstream: Arc<UpstreamClient>) -> Self {
        Self { storage, upstream }
    }

    pub async fn resolve(&self, group: &str, image: &str, digest: &Digest) -> Result<ResolvedBlob> {
        if let Some(record) = self.storage.blob(group, image, digest).await? {
            tracing::info!(
                group = %group,
                image = %image,
                digest = %digest,
                size = record.size,
                "Cache HIT"
            );
            return Ok(ResolvedBlob {
                record,
                source: CacheSource::Hit,
            });
        }

        tracing::info!(
            group = %group,
            image = %image,
            digest = %digest,
            "Cache MISS - fetching blob from upstream"
        );

        let key = format!("{}/{}@{}", group, image, digest);
        let storage = self.storage.clone();
        let upstream = self.upstream.clone();
        let (group_owned, image_owned, digest_owned) =
            (group.to_string(), image.to_string(), digest.clone());

        let record = self
            .storage
            .download_with_dedupe(&key, move || async move {
                // A previous flight may have landed between our lookup and this one
                if let Some(record) = storage.blob(&group_owned, &image_owned, &digest_owned).await? {
                    return Ok(record);
                }
                let token = upstream.request_upstream_token(&image_owned).await?;
                let stream = upstream
                    .fetch_blob(&image_owned, &digest_owned, &token)
                    .await?;
                storage
                    .write_blob_stream(&group_owned, &image_owned, &digest_owned, stream)
                    .await
            })
            .await?;

        tracing::info!(
            group = %group,
            image = %image,
            digest = %digest,
            size = record.size,
            "Blob fetched from upstream and cached"
        );

        Ok(ResolvedBlob {
            record,
            source: CacheSource::Miss,
        })
    }
}
