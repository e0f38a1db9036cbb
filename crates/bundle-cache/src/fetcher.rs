//! Bundle fetching
//!
//! The cache does not know where bundles come from; it asks a [`Fetcher`]
//! for the bytes behind a key and stores them itself.

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_USER_AGENT: &str = "bundle-cache/0.1";
const HTTP_TIMEOUT_SECS: u64 = 30;

/// Produces the bytes for a request key
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>>;
}

/// Fetches bundles over HTTP(S); keys are absolute URLs
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    /// Build from an existing client (shared connection pool)
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn parse_key(key: &str) -> Result<Url> {
        let url = Url::parse(key).map_err(|e| CacheError::InvalidKey(format!("{}: {}", key, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(CacheError::InvalidKey(format!(
                "unsupported scheme {} in {}",
                other, key
            ))),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let url = Self::parse_key(key)?;
        debug!(url = %url, "Fetching bundle");

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if let Some(err) = status_error(status, key) {
            warn!(status = %status, url = %url, "Failed to fetch bundle");
            return Err(err);
        }

        let data = response.bytes().await?.to_vec();
        debug!(url = %url, size = data.len(), "Fetched bundle");
        Ok(data)
    }
}

/// Maps a non-success response status to the error for `key`
///
/// 404 and 410 mean the bundle does not exist and are not retried; any
/// other failure is reported as upstream and retried when it is a 5xx.
fn status_error(status: StatusCode, key: &str) -> Option<CacheError> {
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Some(CacheError::NotFound(key.to_string()));
    }
    if !status.is_success() {
        return Some(CacheError::Upstream {
            status: status.as_u16(),
            key: key.to_string(),
        });
    }
    None
}

/// Copies bundles out of a local directory, e.g. bundles shipped with an app
///
/// URL keys are looked up by their path, other keys as relative paths.
pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn source_path(&self, key: &str) -> Result<PathBuf> {
        let relative = match Url::parse(key) {
            Ok(url) => url.path().trim_start_matches('/').to_string(),
            Err(_) => key.trim_start_matches('/').to_string(),
        };

        let relative = Path::new(&relative);
        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(CacheError::InvalidKey(format!(
                "{} does not name a file under the bundle root",
                key
            )));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Fetcher for LocalFetcher {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.source_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => {
                debug!(path = ?path, size = data.len(), "Read local bundle");
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
