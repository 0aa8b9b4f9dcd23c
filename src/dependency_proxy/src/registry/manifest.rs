use crate::cache::{CacheSource, CacheStorage, ManifestRecord};
use crate::config::DEFAULT_MANIFEST_CONTENT_TYPE;
use crate::error::{DependencyProxyError, Result};
use crate::registry::reference::Digest;
use crate::registry::upstream::UpstreamClient;
use bytes::Bytes;
use std::sync::Arc;

/// A manifest ready to be served
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub record: ManifestRecord,
    pub data: Bytes,
    pub source: CacheSource,
}

/// Resolves (group, image, tag) to manifest bytes.
///
/// Resolution order:
/// 1. Request an upstream token. If upstream is unreachable, serve the last
///    cached manifest; with nothing cached the outage is surfaced.
/// 2. `HEAD` the tag upstream. Same fallback rule on an unreachable upstream.
/// 3. If the cached digest equals the upstream digest, serve the cached bytes.
/// 4. Otherwise `GET` the manifest, verify its digest, upsert the cache and
///    serve it. Failures at this stage are surfaced; upstream answered the
///    token and digest check, so this is not an outage.
pub struct ManifestCache {
    storage: Arc<CacheStorage>,
    upstream: Arc<UpstreamClient>,
}

impl ManifestCache {
    pub fn new(storage: Arc<CacheStorage>, upstream: Arc<UpstreamClient>) -> Self {
        Self { storage, upstream }
    }

    pub async fn resolve(&self, group: &str, image: &str, tag: &str) -> Result<ResolvedManifest> {
        let requested = tag.parse::<Digest>().ok();

        let token = match self.upstream.request_upstream_token(image).await {
            Ok(token) => token,
            Err(e) if e.is_upstream_unavailable() => {
                return self.fallback(group, image, tag, e).await;
            }
            Err(e) => return Err(e),
        };

        let upstream_digest = match self.upstream.head_manifest(image, tag, &token).await {
            Ok(digest) => digest,
            Err(e) if e.is_upstream_unavailable() => {
                return self.fallback(group, image, tag, e).await;
            }
            Err(e) => return Err(e),
        };

        let cached = self.read_cached(group, image, tag).await;
        if let (Some((record, data)), Some(current)) = (cached, upstream_digest.as_ref()) {
            let pinned = requested.as_ref().map_or(true, |requested| requested == current);
            if &record.digest == current && pinned {
                tracing::info!(
                    group = %group,
                    image = %image,
                    tag = %tag,
                    digest = %current,
                    "Cache HIT: upstream digest unchanged"
                );
                return Ok(ResolvedManifest {
                    record,
                    data,
                    source: CacheSource::Hit,
                });
            }
            tracing::info!(
                group = %group,
                image = %image,
                tag = %tag,
                cached = %record.digest,
                upstream = %current,
                "Tag moved upstream - refreshing cached manifest"
            );
        }

        let fetched = self.upstream.fetch_manifest(image, tag, &token).await?;
        let actual = Digest::of(&fetched.data);

        // A digest reference pins the content. Otherwise the GET header is
        // authoritative and the HEAD digest covers upstreams that omit it.
        let upstream_claim = fetched.digest.as_ref().or(upstream_digest.as_ref());
        let claims = [requested.as_ref(), upstream_claim];
        if let Some(claimed) = claims.into_iter().flatten().find(|claimed| *claimed != &actual) {
            tracing::error!(
                group = %group,
                image = %image,
                tag = %tag,
                claimed = %claimed,
                actual = %actual,
                "Upstream manifest does not match its digest - not caching"
            );
            return Err(DependencyProxyError::DigestMismatch {
                expected: claimed.to_string(),
                actual: actual.to_string(),
            });
        }

        let content_type = fetched
            .content_type
            .clone()
            .or_else(|| media_type_of(&fetched.data))
            .unwrap_or_else(|| DEFAULT_MANIFEST_CONTENT_TYPE.to_string());

        let record = self
            .storage
            .write_manifest(group, image, tag, &actual, &content_type, &fetched.data)
            .await?;

        tracing::info!(
            group = %group,
            image = %image,
            tag = %tag,
            digest = %actual,
            size = record.size,
            "Cache MISS: manifest fetched from upstream and cached"
        );

        Ok(ResolvedManifest {
            record,
            data: fetched.data,
            source: CacheSource::Miss,
        })
    }

    async fn read_cached(
        &self,
        group: &str,
        image: &str,
        tag: &str,
    ) -> Option<(ManifestRecord, Bytes)> {
        match self.storage.read_manifest(group, image, tag).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(
                    group = %group,
                    image = %image,
                    tag = %tag,
                    error = %e,
                    "Failed to read cached manifest - treating as miss"
                );
                None
            }
        }
    }

    async fn fallback(
        &self,
        group: &str,
        image: &str,
        tag: &str,
        cause: DependencyProxyError,
    ) -> Result<ResolvedManifest> {
        match self.read_cached(group, image, tag).await {
            Some((record, data)) => {
                tracing::warn!(
                    group = %group,
                    image = %image,
                    tag = %tag,
                    digest = %record.digest,
                    cause = %cause,
                    "Upstream unavailable - serving last cached manifest"
                );
                Ok(ResolvedManifest {
                    record,
                    data,
                    source: CacheSource::Stale,
                })
            }
            None => {
                tracing::error!(
                    group = %group,
                    image = %image,
                    tag = %tag,
                    cause = %cause,
                    "Upstream unavailable and manifest not cached"
                );
                Err(cause)
            }
        }
    }
}

/// `mediaType` declared inside the manifest document, if any
fn media_type_of(data: &[u8]) -> Option<String> {
    let json: serde_json::Value = serde_json::from_slice(data).ok()?;
    json.get("mediaType")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
