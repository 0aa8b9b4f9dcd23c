//! Blob resolution against a mock upstream

mod common;

use common::{storage, MockUpstream};
use dependency_proxy::cache::CacheSource;
use dependency_proxy::error::DependencyProxyError;
use dependency_proxy::registry::{BlobCache, Digest};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_blob_fetched_once_then_served_from_disk() {
    let upstream = MockUpstream::start().await;
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let data = vec![7u8; 256 * 1024];
    let digest = upstream.put_blob(&data);

    let cache = BlobCache::new(storage(temp_dir.path()), upstream.client());

    let first = cache.resolve("g1", "nginx", &digest).await.unwrap();
    assert_eq!(first.source, CacheSource::Miss);
    assert_eq!(first.record.size, data.len() as u64);
    assert_eq!(tokio::fs::read(&first.record.path).await.unwrap(), data);

    let tokens_before = MockUpstream::count(&upstream.state.token_requests);
    let second = cache.resolve("g1", "nginx", &digest).await.unwrap();
    assert_eq!(second.source, CacheSource::Hit);
    assert_eq!(second.record.path, first.record.path);

    // A hit talks to nobody
    assert_eq!(MockUpstream::count(&upstream.state.blob_gets), 1);
    assert_eq!(
        MockUpstream::count(&upstream.state.token_requests),
        tokens_before
    );
}

#[tokio::test]
async fn test_cached_blob_survives_outage() {
    let upstream = MockUpstream::start().await;
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let digest = upstream.put_blob(b"layer bytes");
    let cache = BlobCache::new(storage(temp_dir.path()), upstream.client());

    cache.resolve("g1", "nginx", &digest).await.unwrap();
    upstream.set_down(true);

    let hit = cache.resolve("g1", "nginx", &digest).await.unwrap();
    assert_eq!(hit.source, CacheSource::Hit);
}

#[tokio::test]
async fn test_uncached_blob_during_outage_fails() {
    let upstream = MockUpstream::start().await;
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let digest = upstream.put_blob(b"layer bytes");
    let cache = BlobCache::new(storage(temp_dir.path()), upstream.client());

    upstream.set_down(true);
    let err = cache.resolve("g1", "nginx", &digest).await.unwrap_err();
    assert!(err.is_upstream_unavailable(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_corrupt_blob_is_discarded() {
    let upstream = MockUpstream::start().await;
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let store = storage(temp_dir.path());
    let claimed = Digest::of(b"what the manifest promised");
    upstream.put_blob_as(&claimed, b"what upstream actually sent");

    let cache = BlobCache::new(store.clone(), upstream.client());
    let err = cache.resolve("g1", "nginx", &claimed).await.unwrap_err();
    assert!(matches!(err, DependencyProxyError::DigestMismatch { .. }));

    assert!(store.blob("g1", "nginx", &claimed).await.unwrap().is_none());
    let dir = store.blob_path("g1", "nginx", &claimed);
    let leftovers = std::fs::read_dir(dir.parent().unwrap())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "temp file left behind");
}

#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() {
    let upstream = MockUpstream::start().await;
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let data = vec![42u8; 64 * 1024];
    let digest = upstream.put_blob(&data);
    upstream.state.blob_delay_ms.store(200, Ordering::SeqCst);

    let cache = Arc::new(BlobCache::new(storage(temp_dir.path()), upstream.client()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let digest = digest.clone();
        handles.push(tokio::spawn(async move {
            cache.resolve("g1", "nginx", &digest).await
        }));
    }

    for handle in handles {
        let resolved = handle.await.unwrap().unwrap();
        assert_eq!(resolved.record.size, data.len() as u64);
    }
    assert_eq!(MockUpstream::count(&upstream.state.blob_gets), 1);
}

#[tokio::test]
async fn test_missing_blob_is_not_found() {
    let upstream = MockUpstream::start().await;
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let cache = BlobCache::new(storage(temp_dir.path()), upstream.client());

    let err = cache
        .resolve("g1", "nginx", &Digest::of(b"nobody has this"))
        .await
        .unwrap_err();
    assert!(matches!(err, DependencyProxyError::NotFound(_)));
}

#[tokio::test]
async fn test_stalled_blob_body_times_out_cleanly() {
    let upstream = MockUpstream::start().await;
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let store = storage(temp_dir.path());
    let data = vec![3u8; 32 * 1024];
    let digest = upstream.put_blob(&data);
    upstream.state.stall_blob_body.store(true, Ordering::SeqCst);

    let cache = BlobCache::new(store.clone(), upstream.client());
    let err = cache.resolve("g1", "nginx", &digest).await.unwrap_err();
    assert!(err.is_upstream_unavailable(), "unexpected error: {}", err);

    assert!(store.blob("g1", "nginx", &digest).await.unwrap().is_none());
    let dir = store.blob_path("g1", "nginx", &digest);
    let leftovers = std::fs::read_dir(dir.parent().unwrap())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "partial blob left behind");
}
