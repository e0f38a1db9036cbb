//! Configuration and wire types for the bundle cache server

use bundle_cache::{CacheConfig, CacheStats, ClearPolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ServerError};

const DEFAULT_PORT: u16 = 3005;

/// Configuration for the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub cache: CacheConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            cache: CacheConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Parse configuration from any variable source
    ///
    /// Unset variables fall back to defaults; set but malformed ones are
    /// rejected rather than silently ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let port = parse_var(&lookup, "PORT")?.unwrap_or(defaults.port);

        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache.cache_dir);

        let mut cache = CacheConfig::new(cache_dir);

        if let Some(max_size) = parse_var::<u64>(&lookup, "MAX_CACHE_SIZE")? {
            cache = cache.with_max_size(max_size);
        }
        if let Some(ttl_secs) = parse_var::<u64>(&lookup, "CACHE_TTL_SECS")? {
            cache = cache.with_ttl(Duration::from_secs(ttl_secs));
        }
        if let Some(timeout_secs) = parse_var::<u64>(&lookup, "FETCH_TIMEOUT_SECS")? {
            cache = cache.with_fetch_timeout(Duration::from_secs(timeout_secs));
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "FETCH_RETRIES")? {
            cache = cache.with_retry(RetryPolicy {
                max_attempts: attempts.max(1),
                ..RetryPolicy::default()
            });
        }
        if let Some(policy) = lookup("CLEAR_POLICY") {
            let policy = policy.parse::<ClearPolicy>().map_err(ServerError::Config)?;
            cache = cache.with_clear_policy(policy);
        }

        Ok(Self { port, cache })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ServerError::Config(format!("invalid {}: {}", name, raw))),
        None => Ok(None),
    }
}

/// Query string carrying the request key
#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub request_url: String,
    pub render_url: String,
    pub path: String,
    pub size: u64,
    pub cached: bool,
}

#[derive(Debug, Serialize)]
pub struct RenderUrlResponse {
    pub render_url: String,
}

#[derive(Debug, Serialize)]
pub struct SizeResponse {
    pub total_size: u64,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}
