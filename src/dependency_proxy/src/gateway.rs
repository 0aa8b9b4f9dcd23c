//! Request-level orchestration: the single authorization checkpoint in front
//! of the manifest and blob caches.
//!
//! The gateway knows nothing about HTTP framing. It takes a parsed request,
//! returns either a body to stream or a classified [`GatewayError`], and the
//! server module maps those onto status codes and headers.

use crate::auth::{CredentialVerifier, PullToken, TokenService, ANONYMOUS_SUBJECT};
use crate::cache::{CacheSource, CacheStorage};
use crate::config::{Config, PROXY_SERVICE_NAME};
use crate::error::{AuthError, DependencyProxyError};
use crate::registry::reference::{pull_scope, validate_group, validate_image, validate_tag, Digest};
use crate::registry::{BlobCache, ManifestCache, UpstreamClient};
use base64::Engine;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

const BLOB_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    Manifest { tag: String },
    Blob { digest: String },
}

/// A pull request as seen by the gateway
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub group: String,
    pub image: String,
    pub resource: ResourceKind,
    /// Raw `Authorization` header value
    pub authorization: Option<String>,
}

/// Lifecycle of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Unauthenticated,
    TokenValidated,
    Resolving,
    Served,
    Failed,
}

impl RequestState {
    pub fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Unauthenticated, TokenValidated)
                | (Unauthenticated, Failed)
                | (TokenValidated, Resolving)
                | (Resolving, Served)
                | (Resolving, Failed)
        )
    }
}

struct RequestTracker<'a> {
    state: RequestState,
    group: &'a str,
    image: &'a str,
}

impl<'a> RequestTracker<'a> {
    fn new(group: &'a str, image: &'a str) -> Self {
        Self {
            state: RequestState::Unauthenticated,
            group,
            image,
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(
            group = %self.group,
            image = %self.image,
            from = ?self.state,
            to = ?next,
            "Request state transition"
        );
        self.state = next;
    }
}

/// Authentication challenge returned with 401 responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: String,
        scope: Option<String>,
        error: Option<&'static str>,
    },
    Basic {
        realm: String,
    },
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Challenge::Bearer {
                realm,
                service,
                scope,
                error,
            } => {
                write!(f, r#"Bearer realm="{}",service="{}""#, realm, service)?;
                if let Some(scope) = scope {
                    write!(f, r#",scope="repository:{}:pull""#, scope)?;
                }
                if let Some(error) = error {
                    write!(f, r#",error="{}""#, error)?;
                }
                Ok(())
            }
            Challenge::Basic { realm } => write!(f, r#"Basic realm="{}""#, realm),
        }
    }
}

/// Classified failure; the message is safe to show to clients
#[derive(Debug, Clone)]
pub enum GatewayError {
    Unauthorized {
        error: AuthError,
        challenge: Challenge,
    },
    BadRequest {
        code: &'static str,
        message: String,
    },
    NotFound {
        code: &'static str,
        message: String,
    },
    /// Upstream unreachable, rejected us, or served corrupt data
    BadGateway(DependencyProxyError),
    Internal(DependencyProxyError),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized { .. } => "UNAUTHORIZED",
            GatewayError::BadRequest { code, .. } | GatewayError::NotFound { code, .. } => code,
            GatewayError::BadGateway(_) => "UPSTREAM_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Client-facing message. Upstream and internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Unauthorized { error, .. } => error.to_string(),
            GatewayError::BadRequest { message, .. } | GatewayError::NotFound { message, .. } => {
                message.clone()
            }
            GatewayError::BadGateway(_) => "upstream registry request failed".to_string(),
            GatewayError::Internal(_) => "internal error".to_string(),
        }
    }

    fn bad_request(code: &'static str, e: DependencyProxyError) -> Self {
        GatewayError::BadRequest {
            code,
            message: e.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum ProxyBody {
    Bytes(Bytes),
    /// Cached blob on disk, streamed by the server
    File(PathBuf),
}

#[derive(Debug)]
pub struct ProxyResponse {
    pub content_type: String,
    pub content_length: u64,
    pub digest: Digest,
    pub source: CacheSource,
    pub body: ProxyBody,
}

pub struct ProxyGateway {
    tokens: Arc<TokenService>,
    manifests: ManifestCache,
    blobs: BlobCache,
    credentials: Arc<dyn CredentialVerifier>,
    allow_anonymous: bool,
    external_url: String,
}

impl ProxyGateway {
    pub fn new(
        config: &Config,
        tokens: Arc<TokenService>,
        storage: Arc<CacheStorage>,
        upstream: Arc<UpstreamClient>,
        credentials: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            tokens,
            manifests: ManifestCache::new(storage.clone(), upstream.clone()),
            blobs: BlobCache::new(storage, upstream),
            credentials,
            allow_anonymous: config.auth.allow_anonymous,
            external_url: config.external_url(),
        }
    }

    /// Challenge pointing clients at the token endpoint for `group`
    pub fn challenge(&self, group: Option<&str>, scope: Option<String>) -> Challenge {
        let realm = match group {
            Some(group) => format!("{}/{}/authorize", self.external_url, group),
            None => format!("{}/authorize", self.external_url),
        };
        Challenge::Bearer {
            realm,
            service: PROXY_SERVICE_NAME.to_string(),
            scope,
            error: None,
        }
    }

    pub async fn handle(&self, request: &ProxyRequest) -> Result<ProxyResponse, GatewayError> {
        let group = request.group.as_str();
        let image = request.image.as_str();
        validate_group(group).map_err(|e| GatewayError::bad_request("NAME_INVALID", e))?;
        validate_image(image).map_err(|e| GatewayError::bad_request("NAME_INVALID", e))?;

        let mut tracker = RequestTracker::new(group, image);
        let scope = pull_scope(group, image);

        let subject = match self.authenticate(request.authorization.as_deref(), &scope) {
            Ok(subject) => subject,
            Err(error) => {
                tracker.advance(RequestState::Failed);
                tracing::info!(
                    group = %group,
                    image = %image,
                    error = %error,
                    "Rejected pull request"
                );
                let mut challenge = self.challenge(Some(group), Some(scope));
                if error != AuthError::Unauthenticated {
                    if let Challenge::Bearer { error: e, .. } = &mut challenge {
                        *e = Some("invalid_token");
                    }
                }
                return Err(GatewayError::Unauthorized { error, challenge });
            }
        };
        tracker.advance(RequestState::TokenValidated);
        tracing::debug!(group = %group, image = %image, subject = %subject, "Token validated");

        tracker.advance(RequestState::Resolving);
        let result = match &request.resource {
            ResourceKind::Manifest { tag } => self.serve_manifest(group, image, tag).await,
            ResourceKind::Blob { digest } => self.serve_blob(group, image, digest).await,
        };

        match &result {
            Ok(response) => {
                tracker.advance(RequestState::Served);
                tracing::debug!(
                    group = %group,
                    image = %image,
                    digest = %response.digest,
                    cache = response.source.as_str(),
                    "Request served"
                );
            }
            Err(_) => tracker.advance(RequestState::Failed),
        }
        result
    }

    fn authenticate(&self, authorization: Option<&str>, scope: &str) -> Result<String, AuthError> {
        let token = authorization
            .and_then(|header| credentials_of(header, "bearer"))
            .ok_or(AuthError::Unauthenticated)?;
        self.tokens.validate_token(token, scope)
    }

    async fn serve_manifest(
        &self,
        group: &str,
        image: &str,
        tag: &str,
    ) -> Result<ProxyResponse, GatewayError> {
        validate_tag(tag).map_err(|e| GatewayError::bad_request("TAG_INVALID", e))?;
        let resolved = self
            .manifests
            .resolve(group, image, tag)
            .await
            .map_err(|e| classify(e, "MANIFEST_UNKNOWN"))?;

        Ok(ProxyResponse {
            content_type: resolved.record.content_type.clone(),
            content_length: resolved.data.len() as u64,
            digest: resolved.record.digest.clone(),
            source: resolved.source,
            body: ProxyBody::Bytes(resolved.data),
        })
    }

    async fn serve_blob(
        &self,
        group: &str,
        image: &str,
        digest: &str,
    ) -> Result<ProxyResponse, GatewayError> {
        let digest: Digest = digest
            .parse()
            .map_err(|e| GatewayError::bad_request("DIGEST_INVALID", e))?;
        let resolved = self
            .blobs
            .resolve(group, image, &digest)
            .await
            .map_err(|e| classify(e, "BLOB_UNKNOWN"))?;

        Ok(ProxyResponse {
            content_type: BLOB_CONTENT_TYPE.to_string(),
            content_length: resolved.record.size,
            digest: resolved.record.digest,
            source: resolved.source,
            body: ProxyBody::File(resolved.record.path),
        })
    }

    /// Issue a pull token for the image named in `scope`
    /// (`repository:{group}/{image}:pull`).
    ///
    /// `path_group` is set when the request came in on `/{group}/authorize`;
    /// the scope must then belong to that group.
    pub fn authorize(
        &self,
        path_group: Option<&str>,
        scope: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<PullToken, GatewayError> {
        let scope = scope.ok_or_else(|| GatewayError::BadRequest {
            code: "SCOPE_INVALID",
            message: "scope parameter is required".to_string(),
        })?;
        let (group, image) = parse_pull_scope(scope)?;
        if let Some(path_group) = path_group {
            if path_group != group {
                return Err(GatewayError::BadRequest {
                    code: "SCOPE_INVALID",
                    message: format!("scope {} is outside group {}", scope, path_group),
                });
            }
        }

        let subject = self.authorize_subject(authorization)?;
        let token = self
            .tokens
            .issue_token(&subject, &pull_scope(&group, &image))
            .map_err(GatewayError::Internal)?;

        tracing::info!(
            group = %group,
            image = %image,
            subject = %subject,
            "Pull token issued"
        );
        Ok(token)
    }

    fn authorize_subject(&self, authorization: Option<&str>) -> Result<String, GatewayError> {
        let rejected = |error: AuthError| GatewayError::Unauthorized {
            error,
            challenge: Challenge::Basic {
                realm: PROXY_SERVICE_NAME.to_string(),
            },
        };

        let Some(header) = authorization else {
            return if self.allow_anonymous {
                Ok(ANONYMOUS_SUBJECT.to_string())
            } else {
                Err(rejected(AuthError::Unauthenticated))
            };
        };

        if let Some(encoded) = credentials_of(header, "basic") {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .ok()
                .and_then(|raw| String::from_utf8(raw).ok())
                .ok_or_else(|| rejected(AuthError::InvalidCredentials))?;
            let (username, password) = decoded
                .split_once(':')
                .ok_or_else(|| rejected(AuthError::InvalidCredentials))?;
            return self
                .credentials
                .verify(username, password)
                .ok_or_else(|| {
                    tracing::info!(username = %username, "Invalid credentials on authorize");
                    rejected(AuthError::InvalidCredentials)
                });
        }

        if let Some(token) = credentials_of(header, "bearer") {
            // A live proxy token can be exchanged for a token of another scope
            return self
                .tokens
                .decode(token)
                .map(|claims| claims.sub)
                .map_err(rejected);
        }

        Err(rejected(AuthError::InvalidCredentials))
    }

    /// Registry ping: any live proxy token is accepted
    pub fn check_ping(&self, authorization: Option<&str>) -> Result<(), GatewayError> {
        let token = authorization.and_then(|header| credentials_of(header, "bearer"));
        let outcome = match token {
            Some(token) => self.tokens.decode(token).map(|_| ()),
            None => Err(AuthError::Unauthenticated),
        };
        outcome.map_err(|error| GatewayError::Unauthorized {
            error,
            challenge: self.challenge(None, None),
        })
    }
}

/// Payload of an `Authorization` header for the given scheme (case-insensitive)
fn credentials_of<'h>(header: &'h str, scheme: &str) -> Option<&'h str> {
    let (given, rest) = header.trim().split_once(' ')?;
    if given.eq_ignore_ascii_case(scheme) {
        Some(rest.trim())
    } else {
        None
    }
}

/// `repository:{group}/{image}:pull` -> (group, image)
fn parse_pull_scope(scope: &str) -> Result<(String, String), GatewayError> {
    let invalid = || GatewayError::BadRequest {
        code: "SCOPE_INVALID",
        message: format!("unsupported scope: {}", scope),
    };

    let rest = scope.strip_prefix("repository:").ok_or_else(invalid)?;
    let (path, actions) = rest.rsplit_once(':').ok_or_else(invalid)?;
    if !actions.split(',').any(|a| a == "pull") {
        return Err(invalid());
    }
    let (group, image) = path.split_once('/').ok_or_else(invalid)?;
    validate_group(group).map_err(|e| GatewayError::bad_request("NAME_INVALID", e))?;
    validate_image(image).map_err(|e| GatewayError::bad_request("NAME_INVALID", e))?;
    Ok((group.to_string(), image.to_string()))
}

fn classify(e: DependencyProxyError, not_found_code: &'static str) -> GatewayError {
    match e {
        DependencyProxyError::NotFound(what) => {
            tracing::info!(what = %what, "Upstream reports resource does not exist");
            GatewayError::NotFound {
                code: not_found_code,
                message: "resource not found upstream".to_string(),
            }
        }
        DependencyProxyError::InvalidReference(_) => GatewayError::bad_request("NAME_INVALID", e),
        DependencyProxyError::DigestMismatch { .. } => {
            tracing::error!(error = %e, "Data integrity failure while resolving request");
            GatewayError::BadGateway(e)
        }
        DependencyProxyError::UpstreamUnavailable(_)
        | DependencyProxyError::UpstreamAuth(_)
        | DependencyProxyError::UpstreamStatus { .. } => {
            tracing::warn!(error = %e, "Upstream failure while resolving request");
            GatewayError::BadGateway(e)
        }
        other => {
            tracing::error!(error = %other, "Internal failure while resolving request");
            GatewayError::Internal(other)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_allows_only_forward_paths() {
        use RequestState::*;
        assert!(Unauthenticated.can_advance_to(TokenValidated));
        assert!(Unauthenticated.can_advance_to(Failed));
        assert!(TokenValidated.can_advance_to(Resolving));
        assert!(Resolving.can_advance_to(Served));
        assert!(Resolving.can_advance_to(Failed));

        assert!(!Unauthenticated.can_advance_to(Resolving));
        assert!(!Served.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Served));
    }

    #[test]
    fn bearer_challenge_format() {
        let challenge = Challenge::Bearer {
            realm: "http://proxy/g1/authorize".to_string(),
            service: "dependency_proxy".to_string(),
            scope: Some("g1/nginx".to_string()),
            error: Some("invalid_token"),
        };
        assert_eq!(
            challenge.to_string(),
            r#"Bearer realm="http://proxy/g1/authorize",service="dependency_proxy",scope="repository:g1/nginx:pull",error="invalid_token""#
        );
    }

    #[test]
    fn pull_scope_parsing() {
        assert_eq!(
            parse_pull_scope("repository:g1/library/nginx:pull").unwrap(),
            ("g1".to_string(), "library/nginx".to_string())
        );
        assert!(parse_pull_scope("repository:g1/nginx:push").is_err());
        assert!(parse_pull_scope("repository:nginx:pull").is_err());
        assert!(parse_pull_scope("registry:catalog:*").is_err());
    }

    #[test]
    fn authorization_scheme_is_case_insensitive() {
        assert_eq!(credentials_of("Bearer abc", "bearer"), Some("abc"));
        assert_eq!(credentials_of("bearer  abc ", "bearer"), Some("abc"));
        assert_eq!(credentials_of("Basic abc", "bearer"), None);
        assert_eq!(credentials_of("Bearer", "bearer"), None);
    }
}
