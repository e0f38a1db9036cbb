//! File-based bundle cache with in-memory metadata
//!
//! Entries, their total size, the clear generation and the table of running
//! materializations all sit behind one mutex, so the aggregate size can never
//! be observed half-updated. Concurrent misses for one key share a single
//! spawned materialization task.

use crate::config::{CacheConfig, ClearPolicy};
use crate::error::{CacheError, Result};
use crate::fetcher::Fetcher;
use crate::manifest::{self, Manifest, MANIFEST_FILE, PARTIAL_SUFFIX};
use crate::types::{CacheEntry, CacheStats, Resolved};
use chrono::Utc;
use futures::future::{AbortHandle, AbortRegistration, Abortable, BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

type FlightResult = Shared<BoxFuture<'static, Result<CacheEntry>>>;

/// A materialization in progress, shared by every caller waiting on its key
#[derive(Clone)]
struct Flight {
    id: u64,
    result: FlightResult,
    /// Aborts only the fetch; storing and the generation check always run
    fetch_abort: AbortHandle,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, CacheEntry>,
    total_size: u64,
    /// Bumped by `clear()`; results from an older generation are discarded
    generation: u64,
    in_flight: HashMap<String, Flight>,
    next_flight_id: u64,
}

impl State {
    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_size = self.total_size.saturating_sub(entry.size);
        Some(entry)
    }
}

struct Inner {
    config: CacheConfig,
    /// Canonical cache directory
    root: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    state: Mutex<State>,
    /// Serializes manifest writes
    manifest_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    materializations: AtomicU64,
}

/// Resolves request keys to locally materialized bundles
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<Inner>,
}

impl ResourceCache {
    /// Open (or create) a cache in `config.cache_dir`
    ///
    /// Restores entries from the manifest, dropping any whose file is gone or
    /// has the wrong size, and deletes files the manifest does not know.
    pub async fn open(config: CacheConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir).await?;
        let root = fs::canonicalize(&config.cache_dir).await?;

        let records = match Manifest::load(&root).await {
            Ok(Some(manifest)) if manifest.version == manifest::MANIFEST_VERSION => {
                manifest.entries
            }
            Ok(Some(manifest)) => {
                warn!(version = manifest.version, "Unsupported manifest version, starting empty");
                Vec::new()
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Unreadable manifest, starting empty");
                Vec::new()
            }
        };

        let mut state = State::default();
        for record in records {
            let path = root.join(&record.file);
            match fs::metadata(&path).await {
                Ok(meta) if meta.is_file() && meta.len() == record.size => {
                    state.total_size += record.size;
                    if let Some(old) = state.entries.insert(
                        record.key.clone(),
                        CacheEntry {
                            key: record.key,
                            path,
                            size: record.size,
                            created_at: record.created_at,
                            last_access: record.last_access,
                        },
                    ) {
                        state.total_size -= old.size;
                    }
                }
                _ => {
                    debug!(key = %record.key, file = %record.file, "Dropping stale manifest record");
                }
            }
        }

        let known: HashSet<PathBuf> = state.entries.values().map(|e| e.path.clone()).collect();
        let removed = sweep_orphans(&root, &known).await?;

        info!(
            cache_dir = ?root,
            entries = state.entries.len(),
            total_size = state.total_size,
            orphans_removed = removed,
            "Cache opened"
        );

        let cache = Self {
            inner: Arc::new(Inner {
                config,
                root,
                fetcher,
                state: Mutex::new(state),
                manifest_lock: Mutex::new(()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                materializations: AtomicU64::new(0),
            }),
        };
        cache.inner.persist().await?;

        Ok(cache)
    }

    /// Canonical directory holding the cached files
    pub fn cache_dir(&self) -> &Path {
        &self.inner.root
    }

    /// Resolve `key` to a local file, materializing it on a miss
    ///
    /// Concurrent misses for the same key wait on one materialization and
    /// all receive its result.
    pub async fn resolve(&self, key: &str) -> Result<Resolved> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey("empty key".to_string()));
        }

        if let Some(entry) = self.lookup_present(key).await {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Cache hit");
            return resolved(entry, true);
        }

        let flight = {
            let mut state = self.inner.state.lock().await;

            // Another flight may have landed since the lookup
            let landed = state
                .entries
                .get_mut(key)
                .filter(|entry| !self.inner.is_expired(entry))
                .map(|entry| {
                    entry.last_access = Utc::now();
                    entry.clone()
                });
            if let Some(entry) = landed {
                drop(state);
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return resolved(entry, true);
            }

            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            match state.in_flight.get(key) {
                Some(flight) => {
                    debug!(key, "Joining in-flight materialization");
                    flight.clone()
                }
                None => self.start_flight(&mut state, key),
            }
        };

        let entry = flight.result.await?;
        resolved(entry, false)
    }

    /// Callback form of [`resolve`](Self::resolve)
    ///
    /// The callback runs exactly once, on a tokio worker thread, after the
    /// resolution finishes. Must be called from within a tokio runtime.
    pub fn resolve_with<F>(&self, key: impl Into<String>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Resolved>) + Send + 'static,
    {
        let cache = self.clone();
        let key = key.into();
        tokio::spawn(async move {
            let result = cache.resolve(&key).await;
            callback(result);
        })
    }

    /// URL to render `key` from
    ///
    /// The local `file://` URL when the bundle can be resolved. If resolution
    /// fails and the key is itself an http(s) URL, the remote URL is returned
    /// so the caller can still load the bundle from the network.
    pub async fn render_url(&self, key: &str) -> Result<Url> {
        match self.resolve(key).await {
            Ok(resolved) => Ok(resolved.uri),
            Err(e) => match Url::parse(key) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {
                    warn!(key, error = %e, "Falling back to remote bundle URL");
                    Ok(url)
                }
                _ => Err(e),
            },
        }
    }

    /// Remove every entry and its file, resetting the aggregate size to zero
    ///
    /// In-flight materializations are handled per [`ClearPolicy`]; their
    /// waiters receive [`CacheError::Cancelled`] either way.
    pub async fn clear(&self) -> Result<()> {
        let (removed, flights) = {
            let mut state = self.inner.state.lock().await;
            state.generation += 1;
            state.total_size = 0;
            let removed: Vec<CacheEntry> = state.entries.drain().map(|(_, e)| e).collect();
            let flights: Vec<Flight> = state.in_flight.drain().map(|(_, f)| f).collect();
            (removed, flights)
        };

        if self.inner.config.clear_policy == ClearPolicy::Cancel {
            for flight in &flights {
                flight.fetch_abort.abort();
            }
        }

        let mut first_error = None;
        for entry in &removed {
            if let Err(e) = fs::remove_file(&entry.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key = %entry.key, path = ?entry.path, error = %e, "Failed to delete cached file");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            entries = removed.len(),
            in_flight = flights.len(),
            policy = %self.inner.config.clear_policy,
            "Cache cleared"
        );

        self.inner.persist().await?;

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Total bytes of all live entries
    pub async fn aggregate_size(&self) -> u64 {
        self.inner.state.lock().await.total_size
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether a materialized entry exists for `key` (expiry not checked)
    pub async fn contains(&self, key: &str) -> bool {
        self.inner.state.lock().await.entries.contains_key(key)
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock().await;
        CacheStats {
            entries: state.entries.len(),
            total_size: state.total_size,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            materializations: self.inner.materializations.load(Ordering::Relaxed),
            in_flight: state.in_flight.len(),
        }
    }

    /// Write the manifest now, including access times updated by hits
    pub async fn flush(&self) -> Result<()> {
        self.inner.persist().await
    }

    /// The live entry for `key`, with its access time bumped
    ///
    /// Expired entries and entries whose file vanished are dropped. The
    /// file check runs without holding the state lock.
    async fn lookup_present(&self, key: &str) -> Option<CacheEntry> {
        let (expired, path) = {
            let state = self.inner.state.lock().await;
            let entry = state.entries.get(key)?;
            (self.inner.is_expired(entry), entry.path.clone())
        };

        if expired {
            debug!(key, "Cache entry expired");
            self.drop_entry(key, &path).await;
            return None;
        }
        if !fs::try_exists(&path).await.unwrap_or(false) {
            warn!(key, path = ?path, "Cached file missing, re-materializing");
            self.drop_entry(key, &path).await;
            return None;
        }

        let mut state = self.inner.state.lock().await;
        let entry = state.entries.get_mut(key).filter(|e| e.path == path)?;
        entry.last_access = Utc::now();
        Some(entry.clone())
    }

    /// Remove the entry for `key` if it still points at `path`
    async fn drop_entry(&self, key: &str, path: &Path) {
        let removed = {
            let mut state = self.inner.state.lock().await;
            let current = state.entries.get(key).is_some_and(|e| e.path == path);
            if current {
                state.remove_entry(key)
            } else {
                None
            }
        };

        if let Some(entry) = removed {
            remove_file_quietly(&entry.path).await;
            self.inner.persist_logged().await;
        }
    }

    fn start_flight(&self, state: &mut State, key: &str) -> Flight {
        let id = state.next_flight_id;
        state.next_flight_id += 1;
        let generation = state.generation;

        self.inner.materializations.fetch_add(1, Ordering::Relaxed);
        debug!(key, flight = id, "Starting materialization");

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let (fetch_abort, registration) = AbortHandle::new_pair();
        let handle = tokio::spawn(async move {
            inner
                .materialize(owned_key, id, generation, registration)
                .await
        });

        let result = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(CacheError::Cancelled),
                Err(e) => Err(CacheError::Task(e.to_string())),
            }
        }
        .boxed()
        .shared();

        let flight = Flight {
            id,
            result,
            fetch_abort,
        };
        state.in_flight.insert(key.to_string(), flight.clone());
        flight
    }
}

impl Inner {
    fn is_expired(&self, entry: &CacheEntry) -> bool {
        let Some(ttl) = self.config.ttl else {
            return false;
        };
        let age = (Utc::now() - entry.created_at).to_std().unwrap_or_default();
        age >= ttl
    }

    /// Fetch, store and index `key`. Runs as its own task.
    async fn materialize(
        self: Arc<Self>,
        key: String,
        flight_id: u64,
        generation: u64,
        fetch_registration: AbortRegistration,
    ) -> Result<CacheEntry> {
        let fetched = Abortable::new(self.fetch_with_retry(&key), fetch_registration)
            .await
            .unwrap_or(Err(CacheError::Cancelled));
        let stored = match fetched {
            Ok(data) => self.store(&key, flight_id, &data).await,
            Err(e) => Err(e),
        };

        let mut state = self.state.lock().await;
        if state.in_flight.get(&key).map(|f| f.id) == Some(flight_id) {
            state.in_flight.remove(&key);
        }

        let (path, size) = match stored {
            Ok(stored) => stored,
            Err(e) => {
                drop(state);
                warn!(key = %key, error = %e, "Materialization failed");
                return Err(e);
            }
        };

        if state.generation != generation {
            drop(state);
            debug!(key = %key, "Cache cleared during materialization, discarding result");
            remove_file_quietly(&path).await;
            return Err(CacheError::Cancelled);
        }

        let now = Utc::now();
        let entry = CacheEntry {
            key: key.clone(),
            path,
            size,
            created_at: now,
            last_access: now,
        };

        let mut obsolete = Vec::new();
        if let Some(old) = state.remove_entry(&key) {
            obsolete.push(old);
        }
        state.entries.insert(key.clone(), entry.clone());
        state.total_size += size;
        obsolete.extend(self.evict_over_budget(&mut state, &key));
        drop(state);

        for old in &obsolete {
            if old.path != entry.path {
                remove_file_quietly(&old.path).await;
            }
        }

        info!(key = %key, size, path = ?entry.path, "Materialized bundle");
        self.persist_logged().await;

        Ok(entry)
    }

    async fn fetch_with_retry(&self, key: &str) -> Result<Vec<u8>> {
        let retry = &self.config.retry;
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(
                self.config.fetch_timeout,
                self.fetcher.fetch(key),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(CacheError::Timeout(self.config.fetch_timeout)),
            };

            match result {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    warn!(key, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write `data` to a fresh file, returning its final path and size
    async fn store(&self, key: &str, flight_id: u64, data: &[u8]) -> Result<(PathBuf, u64)> {
        let unique = format!("{:x}-{}", Utc::now().timestamp_millis(), flight_id);
        let path = self.root.join(manifest::file_name_for(key, &unique));
        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        if let Err(e) = fs::write(&partial, data).await {
            remove_file_quietly(&partial).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&partial, &path).await {
            remove_file_quietly(&partial).await;
            return Err(e.into());
        }

        Ok((path, data.len() as u64))
    }

    /// Evict least recently accessed entries (never `keep`) until the size
    /// budget is met
    fn evict_over_budget(&self, state: &mut State, keep: &str) -> Vec<CacheEntry> {
        let Some(max_size) = self.config.max_size else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        while state.total_size > max_size {
            let victim = state
                .entries
                .values()
                .filter(|e| e.key != keep)
                .min_by_key(|e| e.last_access)
                .map(|e| e.key.clone());

            let Some(victim) = victim else {
                warn!(key = keep, size = state.total_size, max_size, "Entry exceeds cache size budget");
                break;
            };

            if let Some(entry) = state.remove_entry(&victim) {
                debug!(key = %entry.key, size = entry.size, "Evicted least recently used entry");
                evicted.push(entry);
            }
        }
        evicted
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;
        let manifest = {
            let state = self.state.lock().await;
            Manifest::from_entries(state.entries.values())
        };
        manifest.save(&self.root).await
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to write cache manifest");
        }
    }
}

fn resolved(entry: CacheEntry, from_cache: bool) -> Result<Resolved> {
    let uri = Url::from_file_path(&entry.path).map_err(|_| {
        CacheError::Io(Arc::new(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("not an absolute path: {}", entry.path.display()),
        )))
    })?;
    Ok(Resolved {
        key: entry.key,
        path: entry.path,
        uri,
        size: entry.size,
        from_cache,
    })
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "Failed to remove file");
        }
    }
}

/// Delete files in `root` that no entry refers to, returning how many
async fn sweep_orphans(root: &Path, known: &HashSet<PathBuf>) -> Result<usize> {
    let mut removed = 0;
    let mut dir = fs::read_dir(root).await?;
    while let Some(item) = dir.next_entry().await? {
        let path = item.path();
        if item.file_name() == MANIFEST_FILE || known.contains(&path) {
            continue;
        }
        if !item.file_type().await?.is_file() {
            continue;
        }
        debug!(path = ?path, "Removing orphaned cache file");
        remove_file_quietly(&path).await;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::fetcher::LocalFetcher;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::{Notify, Semaphore};

    /// Serves fixed bundles and counts calls
    #[derive(Default)]
    struct MapFetcher {
        bundles: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    impl MapFetcher {
        fn with(bundles: &[(&str, &[u8])]) -> Arc<Self> {
            Arc::new(Self {
                bundles: bundles
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_vec()))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for MapFetcher {
        async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.bundles
                .get(key)
                .cloned()
                .ok_or_else(|| CacheError::NotFound(key.to_string()))
        }
    }

    /// Blocks every fetch until the test releases a permit
    struct GatedFetcher {
        started: Notify,
        release: Semaphore,
        calls: AtomicUsize,
        completed: AtomicUsize,
    }

    impl GatedFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: Notify::new(),
                release: Semaphore::new(0),
                calls: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Fetcher for GatedFetcher {
        async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            let permit = self
                .release
                .acquire()
                .await
                .map_err(|e| CacheError::Task(e.to_string()))?;
            permit.forget();
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(format!("bundle for {}", key).into_bytes())
        }
    }

    /// Fails with a transient error a fixed number of times
    struct FlakyFetcher {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for FlakyFetcher {
        async fn fetch(&self, _key: &str) -> Result<Vec<u8>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(std::io::Error::other("connection reset").into());
            }
            Ok(b"finally".to_vec())
        }
    }

    struct SlowFetcher;

    #[async_trait]
    impl Fetcher for SlowFetcher {
        async fn fetch(&self, _key: &str) -> Result<Vec<u8>> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Vec::new())
        }
    }

    fn test_config(dir: &TempDir) -> CacheConfig {
        CacheConfig::new(dir.path().join("cache")).with_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        })
    }

    fn bundle_files(cache: &ResourceCache) -> Vec<PathBuf> {
        std::fs::read_dir(cache.cache_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(MANIFEST_FILE))
            .collect()
    }

    #[tokio::test]
    async fn test_resolve_miss_then_hit() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[("bundle-v1", b"console.log(1)")]);
        let cache = ResourceCache::open(test_config(&dir), fetcher.clone())
            .await
            .unwrap();

        let first = cache.resolve("bundle-v1").await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.size, 14);
        assert_eq!(std::fs::read(&first.path).unwrap(), b"console.log(1)");
        assert_eq!(first.uri.scheme(), "file");
        assert_eq!(cache.aggregate_size().await, 14);

        let second = cache.resolve("bundle-v1").await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.path, first.path);
        assert_eq!(second.uri, first.uri);
        assert_eq!(fetcher.calls(), 1);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.materializations, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_aggregate_size_is_sum_of_entries() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[("a.js", b"12345"), ("b.js", b"1234567890"), ("c.js", b"1")]);
        let cache = ResourceCache::open(test_config(&dir), fetcher).await.unwrap();

        for key in ["a.js", "b.js", "c.js"] {
            cache.resolve(key).await.unwrap();
        }

        assert_eq!(cache.aggregate_size().await, 16);
        assert_eq!(cache.len().await, 3);
        assert!(cache.contains("b.js").await);
    }

    #[tokio::test]
    async fn test_clear_resets_and_rematerializes() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[("bundle-v1", b"v1 contents")]);
        let cache = ResourceCache::open(test_config(&dir), fetcher.clone())
            .await
            .unwrap();

        let first = cache.resolve("bundle-v1").await.unwrap();
        cache.clear().await.unwrap();

        assert_eq!(cache.aggregate_size().await, 0);
        assert!(cache.is_empty().await);
        assert!(!first.path.exists());
        assert!(bundle_files(&cache).is_empty());

        let again = cache.resolve("bundle-v1").await.unwrap();
        assert!(!again.from_cache);
        assert!(again.path.exists());
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(cache.aggregate_size().await, 11);
    }

    #[tokio::test]
    async fn test_clear_empty_cache_is_noop() {
        let dir = tempdir().unwrap();
        let cache = ResourceCache::open(test_config(&dir), MapFetcher::with(&[]))
            .await
            .unwrap();

        cache.clear().await.unwrap();
        cache.clear().await.unwrap();
        assert_eq!(cache.aggregate_size().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_materialization() {
        let dir = tempdir().unwrap();
        let fetcher = GatedFetcher::new();
        let cache = ResourceCache::open(test_config(&dir), fetcher.clone())
            .await
            .unwrap();

        let c1 = cache.clone();
        let c2 = cache.clone();
        let first = tokio::spawn(async move { c1.resolve("bundle-v1").await });
        fetcher.started.notified().await;
        let second = tokio::spawn(async move { c2.resolve("bundle-v1").await });

        // Wait until the second caller has joined the flight
        while cache.stats().await.misses < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        fetcher.release.add_permits(1);

        let r1 = first.await.unwrap().unwrap();
        let r2 = second.await.unwrap().unwrap();
        assert_eq!(r1.path, r2.path);
        assert!(!r1.from_cache && !r2.from_cache);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().await.materializations, 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[]);
        let cache = ResourceCache::open(test_config(&dir), fetcher.clone())
            .await
            .unwrap();

        let err = cache.resolve("missing.js").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(cache.aggregate_size().await, 0);
        assert!(!cache.contains("missing.js").await);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(FlakyFetcher {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let cache = ResourceCache::open(test_config(&dir), fetcher.clone())
            .await
            .unwrap();

        let resolved = cache.resolve("flaky.js").await.unwrap();
        assert_eq!(resolved.size, 7);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(FlakyFetcher {
            failures: 5,
            calls: AtomicUsize::new(0),
        });
        let cache = ResourceCache::open(test_config(&dir), fetcher.clone())
            .await
            .unwrap();

        let err = cache.resolve("flaky.js").await.unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir)
            .with_retry(RetryPolicy::none())
            .with_fetch_timeout(Duration::from_millis(20));
        let cache = ResourceCache::open(config, Arc::new(SlowFetcher))
            .await
            .unwrap();

        let err = cache.resolve("slow.js").await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));
        assert_eq!(cache.stats().await.in_flight, 0);
    }

    #[tokio::test]
    async fn test_clear_cancels_in_flight() {
        let dir = tempdir().unwrap();
        let fetcher = GatedFetcher::new();
        let config = test_config(&dir).with_clear_policy(ClearPolicy::Cancel);
        let cache = ResourceCache::open(config, fetcher.clone()).await.unwrap();

        let c1 = cache.clone();
        let pending = tokio::spawn(async move { c1.resolve("bundle-v1").await });
        fetcher.started.notified().await;

        cache.clear().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
        assert_eq!(cache.aggregate_size().await, 0);
        assert_eq!(fetcher.completed.load(Ordering::SeqCst), 0);

        // A later resolve starts over
        fetcher.release.add_permits(1);
        let resolved = cache.resolve("bundle-v1").await.unwrap();
        assert!(!resolved.from_cache);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_lets_in_flight_complete_then_evicts() {
        let dir = tempdir().unwrap();
        let fetcher = GatedFetcher::new();
        let config = test_config(&dir).with_clear_policy(ClearPolicy::CompleteThenEvict);
        let cache = ResourceCache::open(config, fetcher.clone()).await.unwrap();

        let c1 = cache.clone();
        let pending = tokio::spawn(async move { c1.resolve("bundle-v1").await });
        fetcher.started.notified().await;

        cache.clear().await.unwrap();
        fetcher.release.add_permits(1);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
        assert_eq!(fetcher.completed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.aggregate_size().await, 0);
        assert!(cache.is_empty().await);
        assert!(bundle_files(&cache).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_clear_removes_already_stored_file() {
        let dir = tempdir().unwrap();
        let fetcher = GatedFetcher::new();
        let config = test_config(&dir).with_clear_policy(ClearPolicy::Cancel);
        let cache = ResourceCache::open(config, fetcher.clone()).await.unwrap();

        let c1 = cache.clone();
        let pending = tokio::spawn(async move { c1.resolve("bundle-v1").await });
        fetcher.started.notified().await;

        // Hold the state lock so the flight stores its file, then has to wait
        // behind the clear
        let guard = cache.inner.state.lock().await;
        let c2 = cache.clone();
        let clearing = tokio::spawn(async move { c2.clear().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        fetcher.release.add_permits(1);

        let mut stored = false;
        for _ in 0..500 {
            stored = bundle_files(&cache).iter().any(|p| {
                !p.to_string_lossy().ends_with(PARTIAL_SUFFIX)
            });
            if stored {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(stored);
        drop(guard);

        clearing.await.unwrap().unwrap();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(CacheError::Cancelled)) || result.is_ok());

        // Whichever side won the lock, nothing is left untracked on disk
        assert_eq!(cache.aggregate_size().await, 0);
        assert!(bundle_files(&cache).is_empty());
    }

    #[tokio::test]
    async fn test_open_with_corrupt_manifest_starts_empty() {
        let dir = tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(cache_dir.join(MANIFEST_FILE), b"{ not a manifest").unwrap();
        let bundle = cache_dir.join("abc123.js");
        std::fs::write(&bundle, b"stale bundle").unwrap();

        let cache = ResourceCache::open(test_config(&dir), MapFetcher::with(&[]))
            .await
            .unwrap();

        assert_eq!(cache.len().await, 0);
        assert_eq!(cache.aggregate_size().await, 0);
        assert!(!bundle.exists());
    }

    #[tokio::test]
    async fn test_open_with_unknown_manifest_version_starts_empty() {
        let dir = tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(
            cache_dir.join(MANIFEST_FILE),
            br#"{"version":99,"entries":[]}"#,
        )
        .unwrap();
        let bundle = cache_dir.join("abc123.js");
        std::fs::write(&bundle, b"stale bundle").unwrap();

        let cache = ResourceCache::open(test_config(&dir), MapFetcher::with(&[]))
            .await
            .unwrap();

        assert_eq!(cache.len().await, 0);
        assert!(!bundle.exists());

        let manifest = Manifest::load(cache.cache_dir()).await.unwrap().unwrap();
        assert_eq!(manifest.version, manifest::MANIFEST_VERSION);
    }

    #[tokio::test]
    async fn test_reopen_restores_entries() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[("a.js", b"aaaa"), ("b.js", b"bbbbbb")]);
        let first_path = {
            let cache = ResourceCache::open(test_config(&dir), fetcher.clone())
                .await
                .unwrap();
            cache.resolve("b.js").await.unwrap();
            cache.resolve("a.js").await.unwrap().path
        };

        let fresh = MapFetcher::with(&[]);
        let cache = ResourceCache::open(test_config(&dir), fresh.clone())
            .await
            .unwrap();
        assert_eq!(cache.aggregate_size().await, 10);

        let resolved = cache.resolve("a.js").await.unwrap();
        assert!(resolved.from_cache);
        assert_eq!(resolved.path, first_path);
        assert_eq!(fresh.calls(), 0);
    }

    #[tokio::test]
    async fn test_reopen_drops_missing_files_and_orphans() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[("a.js", b"aaaa"), ("b.js", b"bbbbbb")]);
        let (a_path, cache_dir) = {
            let cache = ResourceCache::open(test_config(&dir), fetcher.clone())
                .await
                .unwrap();
            cache.resolve("b.js").await.unwrap();
            let a = cache.resolve("a.js").await.unwrap().path;
            (a, cache.cache_dir().to_path_buf())
        };

        std::fs::remove_file(&a_path).unwrap();
        let orphan = cache_dir.join("leftover.js.partial");
        std::fs::write(&orphan, b"half").unwrap();

        let cache = ResourceCache::open(test_config(&dir), fetcher).await.unwrap();
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.aggregate_size().await, 6);
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn test_flush_persists_access_times() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[("a.js", b"aaaa")]);
        let cache = ResourceCache::open(test_config(&dir), fetcher).await.unwrap();

        cache.resolve("a.js").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.resolve("a.js").await.unwrap();
        cache.flush().await.unwrap();

        let manifest = Manifest::load(cache.cache_dir()).await.unwrap().unwrap();
        assert_eq!(manifest.entries.len(), 1);
        let record = &manifest.entries[0];
        assert!(record.last_access > record.created_at);
    }

    #[tokio::test]
    async fn test_missing_file_is_rematerialized() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[("a.js", b"aaaa")]);
        let cache = ResourceCache::open(test_config(&dir), fetcher.clone())
            .await
            .unwrap();

        let first = cache.resolve("a.js").await.unwrap();
        std::fs::remove_file(&first.path).unwrap();

        let second = cache.resolve("a.js").await.unwrap();
        assert!(!second.from_cache);
        assert!(second.path.exists());
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(cache.aggregate_size().await, 4);
    }

    #[tokio::test]
    async fn test_size_budget_evicts_least_recently_used() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[
            ("a.js", b"0123456789"),
            ("b.js", b"abcdefghij"),
            ("c.js", b"ABCDEFGHIJ"),
        ]);
        let config = test_config(&dir).with_max_size(20);
        let cache = ResourceCache::open(config, fetcher.clone()).await.unwrap();

        cache.resolve("a.js").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = cache.resolve("b.js").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Touch a so that b becomes the least recently used
        assert!(cache.resolve("a.js").await.unwrap().from_cache);
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.resolve("c.js").await.unwrap();

        assert_eq!(cache.aggregate_size().await, 20);
        assert!(cache.contains("a.js").await);
        assert!(!cache.contains("b.js").await);
        assert!(cache.contains("c.js").await);
        assert!(!b.path.exists());
    }

    #[tokio::test]
    async fn test_oversized_entry_is_kept_alone() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[("small.js", b"1234"), ("huge.js", b"0123456789")]);
        let config = test_config(&dir).with_max_size(8);
        let cache = ResourceCache::open(config, fetcher).await.unwrap();

        cache.resolve("small.js").await.unwrap();
        cache.resolve("huge.js").await.unwrap();

        assert_eq!(cache.len().await, 1);
        assert!(cache.contains("huge.js").await);
        assert_eq!(cache.aggregate_size().await, 10);
    }

    #[tokio::test]
    async fn test_ttl_expiry_rematerializes() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[("a.js", b"aaaa")]);
        let config = test_config(&dir).with_ttl(Duration::from_millis(10));
        let cache = ResourceCache::open(config, fetcher.clone()).await.unwrap();

        let first = cache.resolve("a.js").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = cache.resolve("a.js").await.unwrap();

        assert!(!second.from_cache);
        assert_ne!(first.path, second.path);
        assert!(!first.path.exists());
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(cache.aggregate_size().await, 4);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[]);
        let cache = ResourceCache::open(test_config(&dir), fetcher.clone())
            .await
            .unwrap();

        let err = cache.resolve("").await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_resolve_with_invokes_callback_once() {
        let dir = tempdir().unwrap();
        let fetcher = MapFetcher::with(&[("a.js", b"aaaa")]);
        let cache = ResourceCache::open(test_config(&dir), fetcher).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        cache
            .resolve_with("a.js", move |result| {
                let _ = tx.send(result.map(|r| r.size));
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().unwrap(), 4);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_render_url_prefers_local_file() {
        let dir = tempdir().unwrap();
        let source = tempdir().unwrap();
        std::fs::write(source.path().join("app.js"), b"app").unwrap();
        let cache = ResourceCache::open(test_config(&dir), Arc::new(LocalFetcher::new(source.path())))
            .await
            .unwrap();

        let url = cache
            .render_url("https://cdn.example.com/app.js")
            .await
            .unwrap();
        assert_eq!(url.scheme(), "file");
        assert!(url.path().ends_with(".js"));
    }

    #[tokio::test]
    async fn test_render_url_falls_back_to_remote() {
        let dir = tempdir().unwrap();
        let cache = ResourceCache::open(test_config(&dir), MapFetcher::with(&[]))
            .await
            .unwrap();

        let url = cache
            .render_url("https://cdn.example.com/missing.js")
            .await
            .unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/missing.js");

        let err = cache.render_url("missing.js").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)));
    }
}
