use crate::auth::{StaticCredentials, TokenService};
use crate::cache::CacheStorage;
use crate::config::Config;
use crate::error::{DependencyProxyError, Result};
use crate::gateway::{GatewayError, ProxyBody, ProxyGateway, ProxyRequest, ProxyResponse, ResourceKind};
use crate::registry::UpstreamClient;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;

const V2_PREFIX: &str = "/v2/";
const MANIFESTS_SEGMENT: &str = "/manifests/";
const BLOBS_SEGMENT: &str = "/blobs/";

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ProxyGateway>,
    pub storage: Arc<CacheStorage>,
}

impl AppState {
    /// Wire token service, cache storage and upstream client from `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let secret = match &config.auth.signing_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                tracing::warn!(
                    "No auth.signing_secret configured - using a random secret, issued tokens will not survive a restart"
                );
                let mut secret = vec![0u8; 32];
                getrandom::fill(&mut secret).map_err(|e| {
                    DependencyProxyError::Config(format!("Failed to generate signing secret: {}", e))
                })?;
                secret
            }
        };
        let tokens = Arc::new(TokenService::new(
            &secret,
            Duration::from_secs(config.auth.token_ttl_secs),
        ));

        let cache_dir = PathBuf::from(&config.cache.directory);
        tracing::info!(directory = %cache_dir.display(), "Initializing cache storage");
        let storage = Arc::new(CacheStorage::new(cache_dir)?);

        let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
        tracing::info!(
            registry = %config.upstream.registry_url,
            token_url = %config.upstream.token_url,
            "Configured upstream registry"
        );

        let credentials = Arc::new(StaticCredentials::new(config.auth.users.clone()));
        let gateway = Arc::new(ProxyGateway::new(
            config,
            tokens,
            storage.clone(),
            upstream,
            credentials,
        ));

        Ok(Self { gateway, storage })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v2/", get(api_version))
        .route("/v2/*path", get(get_v2).head(head_v2))
        .route("/authorize", get(authorize))
        .route("/:group/authorize", get(authorize_group))
        .route("/api/v1/cache/stats", get(cache_stats))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind the listener and serve in the background.
///
/// Returns the bound address, which differs from the configured one when
/// port 0 was requested.
pub async fn start_server(config: Config) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let state = AppState::from_config(&config)?;
    let addr = format!("{}:{}", config.server.bind_address, config.server.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| DependencyProxyError::Config(format!("Failed to bind to {}: {}", addr, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| DependencyProxyError::Config(format!("Failed to read bound address: {}", e)))?;

    tracing::info!(
        address = %local_addr,
        external_url = %config.external_url(),
        "Dependency proxy listening"
    );

    let app = build_router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("HTTP server error after startup: {}", e);
        } else {
            tracing::info!("HTTP server stopped");
        }
    });

    Ok((local_addr, handle))
}

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

async fn api_version(State(state): State<AppState>, headers: HeaderMap) -> Response {
    tracing::debug!("GET /v2/ - API version request");
    match state.gateway.check_ping(authorization(&headers).as_deref()) {
        Ok(()) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json"),
                (
                    header::HeaderName::from_static("docker-distribution-api-version"),
                    "registry/2.0",
                ),
            ],
            "{}",
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Split `/v2/{group}/{image...}/(manifests|blobs)/{reference}` into a request.
/// Image names may contain slashes, so the last resource segment wins.
fn parse_v2_path(path: &str, headers: &HeaderMap) -> std::result::Result<ProxyRequest, GatewayError> {
    let invalid = || GatewayError::BadRequest {
        code: "NAME_INVALID",
        message: format!("invalid registry path: {}", path),
    };

    let rest = path.strip_prefix(V2_PREFIX).ok_or_else(invalid)?;
    let (name, resource) = if let Some(idx) = rest.rfind(MANIFESTS_SEGMENT) {
        let tag = rest[idx + MANIFESTS_SEGMENT.len()..].to_string();
        (&rest[..idx], ResourceKind::Manifest { tag })
    } else if let Some(idx) = rest.rfind(BLOBS_SEGMENT) {
        let digest = rest[idx + BLOBS_SEGMENT.len()..].to_string();
        (&rest[..idx], ResourceKind::Blob { digest })
    } else {
        return Err(invalid());
    };

    let (group, image) = name.split_once('/').ok_or_else(invalid)?;
    Ok(ProxyRequest {
        group: group.to_string(),
        image: image.to_string(),
        resource,
        authorization: authorization(headers),
    })
}

async fn get_v2(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
    serve_v2(state, uri, headers, false).await
}

async fn head_v2(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
    serve_v2(state, uri, headers, true).await
}

async fn serve_v2(state: AppState, uri: Uri, headers: HeaderMap, head_only: bool) -> Response {
    let path = uri.path();
    let method = if head_only { "HEAD" } else { "GET" };
    tracing::debug!(
        method = %method,
        path = %path,
        "Received v2 request"
    );

    let request = match parse_v2_path(path, &headers) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    match state.gateway.handle(&request).await {
        Ok(response) => proxy_response(response, head_only).await,
        Err(e) => e.into_response(),
    }
}

async fn proxy_response(response: ProxyResponse, head_only: bool) -> Response {
    let body = if head_only {
        Body::empty()
    } else {
        match response.body {
            ProxyBody::Bytes(data) => Body::from(data),
            ProxyBody::File(path) => match tokio::fs::File::open(&path).await {
                Ok(file) => Body::from_stream(ReaderStream::new(file)),
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %e,
                        "Failed to open cached blob"
                    );
                    return GatewayError::Internal(e.into()).into_response();
                }
            },
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, response.content_length)
        .header("Docker-Content-Digest", response.digest.to_string())
        .header("X-Cache", response.source.as_str());
    if let Ok(content_type) = HeaderValue::from_str(&response.content_type) {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }

    builder.body(body).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to build response");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    scope: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
    access_token: String,
    expires_in: i64,
    issued_at: String,
}

/// GET /authorize
async fn authorize(
    State(state): State<AppState>,
    Query(params): Query<AuthorizeParams>,
    headers: HeaderMap,
) -> Response {
    issue(state, None, params, headers)
}

/// GET /{group}/authorize
async fn authorize_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
    Query(params): Query<AuthorizeParams>,
    headers: HeaderMap,
) -> Response {
    issue(state, Some(group), params, headers)
}

fn issue(state: AppState, group: Option<String>, params: AuthorizeParams, headers: HeaderMap) -> Response {
    let issued = state.gateway.authorize(
        group.as_deref(),
        params.scope.as_deref(),
        authorization(&headers).as_deref(),
    );
    match issued {
        Ok(token) => {
            let issued_at = chrono::DateTime::<chrono::Utc>::from_timestamp(token.claims.iat, 0)
                .unwrap_or_default()
                .to_rfc3339();
            let expires_in = token.expires_in();
            Json(TokenResponse {
                access_token: token.token.clone(),
                token: token.token,
                expires_in,
                issued_at,
            })
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    tracing::debug!("GET /health - Health check request");
    (StatusCode::OK, "ok")
}

/// GET /api/v1/cache/stats
async fn cache_stats(State(state): State<AppState>) -> Response {
    match state.storage.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => GatewayError::Internal(e).into_response(),
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "errors": [{ "code": self.code(), "message": self.public_message() }]
        }));

        let mut response = (status, body).into_response();
        if let GatewayError::Unauthorized { challenge, .. } = &self {
            if let Ok(value) = HeaderValue::from_str(&challenge.to_string()) {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_image_paths_split_on_last_resource_segment() {
        let headers = HeaderMap::new();
        let request = parse_v2_path("/v2/g1/library/nginx/manifests/1.25", &headers).unwrap();
        assert_eq!(request.group, "g1");
        assert_eq!(request.image, "library/nginx");
        assert_eq!(
            request.resource,
            ResourceKind::Manifest {
                tag: "1.25".to_string()
            }
        );

        let request = parse_v2_path("/v2/g1/org/blobs/app/blobs/sha256:abc", &headers).unwrap();
        assert_eq!(request.image, "org/blobs/app");
        assert_eq!(
            request.resource,
            ResourceKind::Blob {
                digest: "sha256:abc".to_string()
            }
        );
    }

    #[test]
    fn paths_without_group_or_resource_are_rejected() {
        let headers = HeaderMap::new();
        assert!(parse_v2_path("/v2/nginx/manifests/latest", &headers).is_err());
        assert!(parse_v2_path("/v2/g1/nginx/tags/list", &headers).is_err());
    }
}
