//! In-process stand-in for an upstream registry and its token endpoint.

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use dependency_proxy::cache::CacheStorage;
use dependency_proxy::config::{
    AuthConfig, CacheConfig, Config, ServerConfig, UpstreamConfig,
};
use dependency_proxy::registry::{Digest, UpstreamClient};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const UPSTREAM_TOKEN: &str = "mock-upstream-token";
pub const SIGNING_SECRET: &str = "test-signing-secret-0123456789";
pub const MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Default)]
pub struct MockState {
    /// "{repository}:{tag}" -> manifest body
    manifests: Mutex<HashMap<String, Bytes>>,
    /// digest -> blob body
    blobs: Mutex<HashMap<String, Bytes>>,
    pub token_requests: AtomicUsize,
    pub manifest_heads: AtomicUsize,
    pub manifest_gets: AtomicUsize,
    pub blob_gets: AtomicUsize,
    /// Answer everything with 503
    pub down: AtomicBool,
    /// Advertise a digest that does not match the manifest body
    pub lie_about_digest: AtomicBool,
    pub blob_delay_ms: AtomicU64,
    /// Hold token responses back this long
    pub token_delay_ms: AtomicU64,
    /// Answer manifest HEAD with 503 while everything else works
    pub head_down: AtomicBool,
    /// Send the first half of a blob, then go quiet
    pub stall_blob_body: AtomicBool,
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

/// Route proxy logs through the test harness; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("dependency_proxy=debug"))
        .with_test_writer()
        .try_init();
}

impl MockUpstream {
    pub async fn start() -> Self {
        init_tracing();
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/token", get(token))
            .route("/v2/*rest", get(registry).head(registry))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Publish `body` as `repository:tag` and return its digest
    pub fn put_manifest(&self, repository: &str, tag: &str, body: &[u8]) -> Digest {
        self.state
            .manifests
            .lock()
            .unwrap()
            .insert(format!("{}:{}", repository, tag), Bytes::copy_from_slice(body));
        Digest::of(body)
    }

    pub fn put_blob(&self, body: &[u8]) -> Digest {
        let digest = Digest::of(body);
        self.put_blob_as(&digest, body);
        digest
    }

    /// Serve `body` under `digest`, matching or not
    pub fn put_blob_as(&self, digest: &Digest, body: &[u8]) {
        self.state
            .blobs
            .lock()
            .unwrap()
            .insert(digest.to_string(), Bytes::copy_from_slice(body));
    }

    pub fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            registry_url: format!("http://{}", self.addr),
            token_url: format!("http://{}/token", self.addr),
            service: "mock-registry".to_string(),
            timeout_secs: 2,
            connect_timeout_secs: 1,
            insecure: false,
            auth: None,
        }
    }

    pub fn client(&self) -> Arc<UpstreamClient> {
        Arc::new(UpstreamClient::new(&self.upstream_config()).unwrap())
    }

    /// Proxy config listening on an ephemeral port
    pub fn proxy_config(&self, cache_dir: &Path) -> Config {
        Config {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 0,
                external_url: Some("http://proxy.test".to_string()),
            },
            cache: CacheConfig {
                directory: cache_dir.display().to_string(),
            },
            upstream: self.upstream_config(),
            auth: AuthConfig {
                signing_secret: Some(SIGNING_SECRET.to_string()),
                ..AuthConfig::default()
            },
        }
    }
}

pub fn storage(dir: &Path) -> Arc<CacheStorage> {
    Arc::new(CacheStorage::new(dir.to_path_buf()).unwrap())
}

/// A small but realistic image manifest
pub fn manifest_body(layer: &Digest) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_TYPE,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 2,
            "digest": Digest::of(b"{}").to_string(),
        },
        "layers": [{
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "size": 1024,
            "digest": layer.to_string(),
        }],
    }))
    .unwrap()
}

async fn token(State(state): State<Arc<MockState>>) -> Response {
    state.token_requests.fetch_add(1, Ordering::SeqCst);
    let delay = state.token_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if state.down.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(serde_json::json!({ "token": UPSTREAM_TOKEN, "expires_in": 300 })).into_response()
}

async fn registry(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if state.down.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", UPSTREAM_TOKEN));
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let path = uri.path().trim_start_matches("/v2/");
    if let Some(idx) = path.rfind("/manifests/") {
        let key = format!("{}:{}", &path[..idx], &path[idx + "/manifests/".len()..]);
        if method == Method::HEAD {
            state.manifest_heads.fetch_add(1, Ordering::SeqCst);
            if state.head_down.load(Ordering::SeqCst) {
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        } else {
            state.manifest_gets.fetch_add(1, Ordering::SeqCst);
        }
        let body = state.manifests.lock().unwrap().get(&key).cloned();
        let Some(body) = body else {
            return StatusCode::NOT_FOUND.into_response();
        };
        let digest = if state.lie_about_digest.load(Ordering::SeqCst) {
            Digest::of(b"something else entirely")
        } else {
            Digest::of(&body)
        };
        let body = if method == Method::HEAD {
            Body::empty()
        } else {
            Body::from(body)
        };
        return Response::builder()
            .header(header::CONTENT_TYPE, MANIFEST_TYPE)
            .header("Docker-Content-Digest", digest.to_string())
            .body(body)
            .unwrap();
    }

    if let Some(idx) = path.rfind("/blobs/") {
        state.blob_gets.fetch_add(1, Ordering::SeqCst);
        let digest = &path[idx + "/blobs/".len()..];
        let body = state.blobs.lock().unwrap().get(digest).cloned();
        let Some(body) = body else {
            return StatusCode::NOT_FOUND.into_response();
        };
        let delay = state.blob_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if state.stall_blob_body.load(Ordering::SeqCst) {
            let (head, tail) = body.split_at(body.len() / 2);
            let (head, tail) = (Bytes::copy_from_slice(head), Bytes::copy_from_slice(tail));
            let chunks = futures::stream::iter([Ok::<_, std::io::Error>(head)]).chain(
                futures::stream::once(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(tail)
                }),
            );
            return Response::builder()
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from_stream(chunks))
                .unwrap();
        }
        return Response::builder()
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(body))
            .unwrap();
    }

    StatusCode::NOT_FOUND.into_response()
}
