//! Pull-through cache for container images.
//!
//! Clients authenticate against the proxy's own short-lived, image-scoped
//! bearer tokens. Manifests are revalidated against the upstream registry on
//! every pull and served from the last cached copy when upstream is down;
//! blobs are content-addressed and fetched at most once.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod server;

pub use cache::CacheStorage;
pub use config::Config;
pub use error::{AuthError, DependencyProxyError, Result};
pub use gateway::{ProxyGateway, ProxyRequest, ProxyResponse, RequestState, ResourceKind};
pub use server::{build_router, start_server, AppState};
