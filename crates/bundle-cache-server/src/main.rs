//! Bundle Cache Server
//!
//! Resolves remote JS bundle URLs to locally cached files and reports or
//! clears the cache over HTTP.

mod error;
mod server;
mod types;

use crate::error::Result;
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ServerConfig;
use bundle_cache::{HttpFetcher, ResourceCache};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("bundle_cache=info".parse()?)
        .add_directive("bundle_cache_server=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting bundle cache server...");

    let config = ServerConfig::from_env()?;
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache.cache_dir);
    match config.cache.max_size {
        Some(max) => info!("Max cache size: {} MB", max / (1024 * 1024)),
        None => info!("Max cache size: unbounded"),
    }
    info!("Fetch timeout: {:?}", config.cache.fetch_timeout);
    info!("Clear policy: {}", config.cache.clear_policy);

    let fetcher = Arc::new(HttpFetcher::new()?);
    let cache = ResourceCache::open(config.cache, fetcher).await?;

    let state: SharedState = Arc::new(ServerState::new(cache));

    // Start HTTP server (blocking)
    start_server(state, config.port).await?;

    Ok(())
}
