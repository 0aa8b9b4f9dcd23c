use crate::config::{UpstreamConfig, DEFAULT_MANIFEST_ACCEPT_HEADER};
use crate::error::{DependencyProxyError, Result};
use crate::registry::reference::{upstream_repository, Digest};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Bearer token issued by the upstream registry's token endpoint
#[derive(Clone)]
pub struct UpstreamToken(String);

impl UpstreamToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UpstreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UpstreamToken(..)")
    }
}

/// A manifest body as returned by upstream
#[derive(Debug, Clone)]
pub struct UpstreamManifest {
    /// Value of `Docker-Content-Digest`, if upstream sent a parseable one
    pub digest: Option<Digest>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// HTTP client for the upstream registry.
///
/// Every failure is translated into the proxy's error taxonomy here:
/// timeouts and connection failures become `UpstreamUnavailable`, so callers
/// never see a raw transport error.
pub struct UpstreamClient {
    client: Client,
    registry_url: String,
    token_url: String,
    service: String,
    timeout: Duration,
    auth: Option<(String, String)>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| DependencyProxyError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let auth = config
            .auth
            .as_ref()
            .map(|a| (a.username.clone(), a.password.clone()));

        Ok(Self {
            client,
            registry_url: config.registry_url.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            service: config.service.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            auth,
        })
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    /// Obtain an anonymous (or configured-credential) pull token for `image`
    pub async fn request_upstream_token(&self, image: &str) -> Result<UpstreamToken> {
        let scope = format!("repository:{}:pull", upstream_repository(image));
        let mut request = self
            .client
            .get(&self.token_url)
            .query(&[("service", self.service.as_str()), ("scope", scope.as_str())]);
        if let Some((username, password)) = &self.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = self.send(request, "token request").await?;
        let status = response.status();
        if !status.is_success() {
            if is_outage_status(status) {
                return Err(DependencyProxyError::UpstreamUnavailable(format!(
                    "token endpoint returned {}",
                    status
                )));
            }
            tracing::warn!(
                image = %image,
                status = %status,
                "Upstream token endpoint rejected the request"
            );
            return Err(DependencyProxyError::UpstreamAuth(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let body = self.read_body(response, "token response").await?;
        let parsed: TokenResponse = serde_json::from_slice(&body).map_err(|e| {
            DependencyProxyError::UpstreamAuth(format!("malformed token response: {}", e))
        })?;

        // Docker Hub answers with "token"; some registries only send "access_token"
        parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .map(UpstreamToken)
            .ok_or_else(|| {
                DependencyProxyError::UpstreamAuth("token response carried no token".to_string())
            })
    }

    /// Current digest of (image, tag) without transferring the manifest body.
    /// `None` when upstream answers without a usable `Docker-Content-Digest`.
    pub async fn head_manifest(
        &self,
        image: &str,
        tag: &str,
        token: &UpstreamToken,
    ) -> Result<Option<Digest>> {
        let url = self.manifest_url(image, tag);
        let request = self
            .client
            .head(&url)
            .bearer_auth(token.as_str())
            .header(ACCEPT, DEFAULT_MANIFEST_ACCEPT_HEADER);

        let response = self.send(request, "manifest HEAD").await?;
        check_status(response.status(), &url)?;
        Ok(digest_header(&response))
    }

    pub async fn fetch_manifest(
        &self,
        image: &str,
        tag: &str,
        token: &UpstreamToken,
    ) -> Result<UpstreamManifest> {
        let url = self.manifest_url(image, tag);
        let request = self
            .client
            .get(&url)
            .bearer_auth(token.as_str())
            .header(ACCEPT, DEFAULT_MANIFEST_ACCEPT_HEADER);

        let response = self.send(request, "manifest GET").await?;
        check_status(response.status(), &url)?;

        let digest = digest_header(&response);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let data = self.read_body(response, "manifest body").await?;

        tracing::debug!(
            url = %url,
            size = data.len(),
            digest = ?digest.as_ref().map(|d| d.to_string()),
            "Manifest fetched from upstream"
        );

        Ok(UpstreamManifest {
            digest,
            content_type,
            data,
        })
    }

    /// Stream a blob from upstream. Each chunk must arrive within the
    /// configured timeout, otherwise the stream yields `UpstreamUnavailable`.
    pub async fn fetch_blob(
        &self,
        image: &str,
        digest: &Digest,
        token: &UpstreamToken,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.registry_url,
            upstream_repository(image),
            digest
        );
        let request = self.client.get(&url).bearer_auth(token.as_str());

        let response = self.send(request, "blob GET").await?;
        check_status(response.status(), &url)?;

        let timeout = self.timeout;
        let chunks = tokio_stream::StreamExt::timeout(response.bytes_stream(), timeout);
        Ok(chunks
            .map(move |item| match item {
                Ok(Ok(chunk)) => Ok(chunk),
                Ok(Err(e)) => Err(transport_error("blob body", e)),
                Err(_) => Err(DependencyProxyError::UpstreamUnavailable(format!(
                    "blob body stalled for more than {:?}",
                    timeout
                ))),
            })
            .boxed())
    }

    fn manifest_url(&self, image: &str, tag: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url,
            upstream_repository(image),
            tag
        )
    }

    /// Send with a bounded wait for the response head
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        with_timeout(self.timeout, what, request.send()).await
    }

    async fn read_body(&self, response: Response, what: &str) -> Result<Bytes> {
        with_timeout(self.timeout, what, response.bytes()).await
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    what: &str,
    fut: impl Future<Output = std::result::Result<T, reqwest::Error>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(transport_error(what, e)),
        Err(_) => {
            tracing::warn!(what = %what, timeout = ?timeout, "Upstream call timed out");
            Err(DependencyProxyError::UpstreamUnavailable(format!(
                "{} timed out after {:?}",
                what, timeout
            )))
        }
    }
}

fn transport_error(what: &str, e: reqwest::Error) -> DependencyProxyError {
    tracing::warn!(what = %what, error = %e, "Upstream transport failure");
    DependencyProxyError::UpstreamUnavailable(format!("{} failed: {}", what, e))
}

/// Rate limiting and server-side failures count as an outage
fn is_outage_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn check_status(status: StatusCode, url: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::NOT_FOUND => Err(DependencyProxyError::NotFound(url.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DependencyProxyError::UpstreamAuth(
            format!("{} returned {}", url, status),
        )),
        s if is_outage_status(s) => Err(DependencyProxyError::UpstreamUnavailable(format!(
            "{} returned {}",
            url, status
        ))),
        s => Err(DependencyProxyError::UpstreamStatus {
            status: s.as_u16(),
            message: url.to_string(),
        }),
    }
}

fn digest_header(response: &Response) -> Option<Digest> {
    let raw = response
        .headers()
        .get(DOCKER_CONTENT_DIGEST)
        .and_then(|v| v.to_str().ok())?;
    match raw.parse::<Digest>() {
        Ok(digest) => Some(digest),
        Err(e) => {
            tracing::warn!(header = %raw, error = %e, "Ignoring unparseable Docker-Content-Digest");
            None
        }
    }
}
