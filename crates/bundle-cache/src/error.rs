//! Error types for the bundle cache

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Errors produced while resolving, materializing or evicting cached bundles.
///
/// Cloneable so that a single materialization result can be handed to every
/// caller waiting on the same key.
#[derive(Debug, Clone)]
pub enum CacheError {
    InvalidKey(String),
    NotFound(String),
    Upstream { status: u16, key: String },
    Http(Arc<reqwest::Error>),
    Io(Arc<std::io::Error>),
    Timeout(Duration),
    Cancelled,
    Manifest(String),
    Task(String),
}

impl CacheError {
    /// Whether another fetch attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Http(_) | CacheError::Io(_) | CacheError::Timeout(_) => true,
            CacheError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::InvalidKey(msg) => write!(f, "Invalid key: {}", msg),
            CacheError::NotFound(key) => write!(f, "Resource not found: {}", key),
            CacheError::Upstream { status, key } => {
                write!(f, "Upstream returned status {} for {}", status, key)
            }
            CacheError::Http(err) => write!(f, "HTTP error: {}", err),
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::Timeout(after) => write!(f, "Fetch timed out after {:?}", after),
            CacheError::Cancelled => write!(f, "Materialization cancelled"),
            CacheError::Manifest(msg) => write!(f, "Manifest error: {}", msg),
            CacheError::Task(msg) => write!(f, "Materialization task failed: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Http(err) => Some(err.as_ref()),
            CacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Http(Arc::new(err))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Manifest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
