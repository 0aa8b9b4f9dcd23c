use thiserror::Error;

pub type Result<T> = std::result::Result<T, DependencyProxyError>;

/// Failures of the proxy's own bearer-token scheme.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no bearer token presented")]
    Unauthenticated,

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("token scope {actual} does not grant access to {expected}")]
    ScopeMismatch { expected: String, actual: String },

    #[error("token is malformed")]
    Malformed,

    #[error("invalid credentials")]
    InvalidCredentials,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyProxyError {
    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream rejected token request: {0}")]
    UpstreamAuth(String),

    #[error("Upstream returned unexpected status {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signing error: {0}")]
    Signing(String),
}

impl DependencyProxyError {
    /// Only an unreachable upstream may be answered from a previously cached manifest.
    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(self, DependencyProxyError::UpstreamUnavailable(_))
    }
}

impl From<std::io::Error> for DependencyProxyError {
    fn from(e: std::io::Error) -> Self {
        DependencyProxyError::Cache(e.to_string())
    }
}

impl From<serde_json::Error> for DependencyProxyError {
    fn from(e: serde_json::Error) -> Self {
        DependencyProxyError::Cache(format!("Serialization error: {}", e))
    }
}
