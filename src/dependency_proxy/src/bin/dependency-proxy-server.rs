use dependency_proxy::{start_server, Config};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dependency_proxy=info")),
        )
        .init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            Config::from_file(&path)?
        }
        None => {
            tracing::info!("No config file given - using defaults");
            Config::default()
        }
    };

    tracing::info!("Cache directory: {}", config.cache.directory);
    tracing::info!("Server endpoints:");
    tracing::info!("  Health: {}/health", config.external_url());
    tracing::info!("  API: {}/v2/", config.external_url());
    tracing::info!("  Token: {}/{{group}}/authorize", config.external_url());

    let (_addr, handle) = start_server(config).await?;
    handle.await?;
    Ok(())
}
