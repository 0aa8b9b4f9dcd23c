use crate::error::{DependencyProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Default upstream registry (Docker Hub)
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Docker Hub token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://auth.docker.io/token";

/// Service name Docker Hub expects on token requests
pub const DEFAULT_UPSTREAM_SERVICE: &str = "registry.docker.io";

/// Service name advertised in the proxy's own challenges
pub const PROXY_SERVICE_NAME: &str = "dependency_proxy";

/// Manifest Accept header for upstream requests.
/// Lists come first so multi-arch tags resolve to their index.
pub const DEFAULT_MANIFEST_ACCEPT_HEADER: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

/// Content type used when upstream does not declare one
pub const DEFAULT_MANIFEST_CONTENT_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Lifetime of an issued pull token (5 minutes)
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 300;

/// Bounded wait for any single upstream call
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Base URL clients use to reach the proxy; the challenge realm is built from it
    #[serde(default)]
    pub external_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_upstream_service")]
    pub service: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub auth: Option<RegistryAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for pull tokens. Generated at start-up when absent.
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    /// username -> password accepted as basic credentials on the authorize endpoint
    #[serde(default)]
    pub users: HashMap<String, String>,
}

fn default_registry_url() -> String {
    DEFAULT_REGISTRY_URL.to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_upstream_service() -> String {
    DEFAULT_UPSTREAM_SERVICE.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT_SECS
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}

fn default_true() -> bool {
    true
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            registry_url: default_registry_url(),
            token_url: default_token_url(),
            service: default_upstream_service(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            insecure: false,
            auth: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            token_ttl_secs: default_token_ttl_secs(),
            allow_anonymous: true,
            users: HashMap::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 5050,
                external_url: None,
            },
            cache: CacheConfig {
                directory: "cache/dependency-proxy".to_string(),
            },
            upstream: UpstreamConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| DependencyProxyError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DependencyProxyError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream.registry_url.is_empty() {
            return Err(DependencyProxyError::Config(
                "upstream.registry_url must not be empty".to_string(),
            ));
        }
        if self.upstream.token_url.is_empty() {
            return Err(DependencyProxyError::Config(
                "upstream.token_url must not be empty".to_string(),
            ));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(DependencyProxyError::Config(
                "upstream.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.auth.token_ttl_secs == 0 {
            return Err(DependencyProxyError::Config(
                "auth.token_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if matches!(&self.auth.signing_secret, Some(secret) if secret.len() < 16) {
            return Err(DependencyProxyError::Config(
                "auth.signing_secret must be at least 16 bytes".to_string(),
            ));
        }
        Ok(())
    }

    /// Base URL advertised in challenges, without trailing slash
    pub fn external_url(&self) -> String {
        self.server
            .external_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.server.port))
            .trim_end_matches('/')
            .to_string()
    }
}
