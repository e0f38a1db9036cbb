//! Bundle cache
//!
//! Resolves request keys (typically remote JS bundle URLs) to locally
//! materialized files. Misses are fetched through an injected [`Fetcher`],
//! concurrent misses for the same key share one fetch, and the cache keeps an
//! exact running total of the bytes it holds. An on-disk manifest makes the
//! accounting survive restarts.

mod cache;
mod config;
mod error;
mod fetcher;
mod manifest;
mod types;

pub use cache::ResourceCache;
pub use config::{CacheConfig, ClearPolicy, RetryPolicy};
pub use error::{CacheError, Result};
pub use fetcher::{Fetcher, HttpFetcher, LocalFetcher};
pub use types::{CacheEntry, CacheStats, Resolved};
