//! Cache configuration

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 200;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 5;

/// What `clear()` does with materializations that are still running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClearPolicy {
    /// Abort in-flight fetches; waiters receive `Cancelled`
    #[default]
    Cancel,
    /// Let in-flight fetches finish, then discard the result; waiters
    /// receive `Cancelled`
    CompleteThenEvict,
}

impl FromStr for ClearPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cancel" => Ok(ClearPolicy::Cancel),
            "complete" | "complete-then-evict" | "complete_then_evict" => {
                Ok(ClearPolicy::CompleteThenEvict)
            }
            other => Err(format!("unknown clear policy: {}", other)),
        }
    }
}

impl fmt::Display for ClearPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClearPolicy::Cancel => write!(f, "cancel"),
            ClearPolicy::CompleteThenEvict => write!(f, "complete-then-evict"),
        }
    }
}

/// Retry behavior for failed fetch attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
        }
    }
}

/// Configuration for a [`ResourceCache`](crate::ResourceCache)
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding materialized bundles and the manifest
    pub cache_dir: PathBuf,
    /// Size budget in bytes; `None` means unbounded
    pub max_size: Option<u64>,
    /// Entries older than this are re-materialized; `None` disables expiry
    pub ttl: Option<Duration>,
    /// Timeout applied to each fetch attempt
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
    pub clear_policy: ClearPolicy,
}

impl CacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clear_policy(mut self, policy: ClearPolicy) -> Self {
        self.clear_policy = policy;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/bundles"),
            max_size: None,
            ttl: None,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            clear_policy: ClearPolicy::default(),
        }
    }
}
