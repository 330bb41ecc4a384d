//! In-process key/value cache with per-entry TTL.
//!
//! Used by the tile server for image metadata, content metadata and index
//! maps. Entries expire lazily on read and are also removed by a background
//! sweep running on its own timer.
//!
//! # Capacity
//!
//! Besides TTL expiry the cache is bounded by a maximum number of entries;
//! inserting past the bound evicts the least-recently-used entry.
//!
//! # Pattern deletion
//!
//! [`Cache::delete_pattern`] accepts a restricted glob, not a regex. See
//! [`glob_match`] for the exact rules. Character classes, `?` and escaping
//! are not supported.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default maximum number of entries
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Default interval between background sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Configuration
// =============================================================================

/// Cache construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum number of live entries before LRU eviction
    pub max_entries: usize,

    /// Interval between sweeps of expired entries. Zero disables the sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Snapshot of the cache counters.
///
/// Counters are read independently, so a snapshot taken during mutation may
/// be slightly inconsistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: u64,
}

// =============================================================================
// Cache
// =============================================================================

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Inner<V> {
    entries: Mutex<LruCache<String, Entry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    size: AtomicU64,
}

impl<V> Inner<V> {
    fn record_size(&self, entries: &LruCache<String, Entry<V>>) {
        self.size.store(entries.len() as u64, Ordering::Relaxed);
    }

    /// Remove every expired entry, returning how many were removed.
    async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }
        self.record_size(&entries);
        self.evictions
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }
}

/// Generic TTL cache keyed by strings.
///
/// The cache is thread-safe and meant to be shared via `Arc`. Dropping it
/// stops the background sweep.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use slide_pipeline::cache::{Cache, CacheConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let cache: Cache<String> = Cache::new(CacheConfig::default());
///
///     cache.set("image:metadata:1", "slide".to_string(), Duration::from_secs(600)).await;
///     assert_eq!(cache.get("image:metadata:1").await.as_deref(), Some("slide"));
///
///     cache.delete_pattern("image:*").await;
///     assert!(!cache.has("image:metadata:1").await);
/// }
/// ```
pub struct Cache<V> {
    inner: Arc<Inner<V>>,
    sweeper: CancellationToken,
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    /// Create a cache and, when the sweep interval is non-zero, start the
    /// background sweep on the current Tokio runtime.
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        let inner = Arc::new(Inner {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            size: AtomicU64::new(0),
        });

        let sweeper = CancellationToken::new();
        if !config.sweep_interval.is_zero() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(sweep_loop(
                        Arc::downgrade(&inner),
                        config.sweep_interval,
                        sweeper.clone(),
                    ));
                }
                Err(_) => warn!("No Tokio runtime available, cache sweep disabled"),
            }
        }

        Self { inner, sweeper }
    }

    /// Get a live value, marking it recently used.
    pub async fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.inner.entries.lock().await;
        let value = self.lookup(&mut entries, key, Instant::now());
        self.inner.record_size(&entries);
        value
    }

    /// Store a value. A zero `ttl` means the entry never expires.
    pub async fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let mut entries = self.inner.entries.lock().await;
        self.insert(&mut entries, key.into(), value, ttl, Instant::now());
        self.inner.record_size(&entries);
    }

    /// Whether a live entry exists. Does not change LRU order.
    pub async fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock().await;
        let live = match entries.peek(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.pop(key);
                false
            }
            Some(_) => true,
            None => false,
        };
        if live {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.record_size(&entries);
        live
    }

    /// Remove one entry. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> bool {
        let mut entries = self.inner.entries.lock().await;
        let removed = entries.pop(key).is_some();
        self.inner.record_size(&entries);
        removed
    }

    /// Remove every entry whose key matches `pattern` (see [`glob_match`]).
    /// Returns the number of entries removed.
    pub async fn delete_pattern(&self, pattern: &str) -> usize {
        let mut entries = self.inner.entries.lock().await;
        let matching: Vec<String> = entries
            .iter()
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &matching {
            entries.pop(key);
        }
        self.inner.record_size(&entries);
        debug!(pattern, removed = matching.len(), "Cache pattern delete");
        matching.len()
    }

    pub async fn clear(&self) {
        let mut entries = self.inner.entries.lock().await;
        entries.clear();
        self.inner.record_size(&entries);
    }

    /// Get several values at once, in key order.
    pub async fn mget(&self, keys: &[&str]) -> Vec<Option<V>> {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock().await;
        let values = keys
            .iter()
            .map(|key| self.lookup(&mut entries, key, now))
            .collect();
        self.inner.record_size(&entries);
        values
    }

    /// Store several values with the same TTL.
    pub async fn mset(&self, items: Vec<(String, V)>, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock().await;
        for (key, value) in items {
            self.insert(&mut entries, key, value, ttl, now);
        }
        self.inner.record_size(&entries);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            size: self.inner.size.load(Ordering::Relaxed),
        }
    }

    /// Remove expired entries now instead of waiting for the sweep.
    pub async fn purge_expired(&self) -> usize {
        self.inner.sweep().await
    }

    fn lookup(
        &self,
        entries: &mut LruCache<String, Entry<V>>,
        key: &str,
        now: Instant,
    ) -> Option<V> {
        let hit = match entries.get(key) {
            Some(entry) if entry.is_expired(now) => None,
            Some(entry) => Some(entry.value.clone()),
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match hit {
            Some(value) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                // Expired but not yet swept
                entries.pop(key);
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn insert(
        &self,
        entries: &mut LruCache<String, Entry<V>>,
        key: String,
        value: V,
        ttl: Duration,
        now: Instant,
    ) {
        let expires_at = if ttl.is_zero() { None } else { Some(now + ttl) };
        if let Some((evicted, _)) = entries.push(key.clone(), Entry { value, expires_at }) {
            if evicted != key {
                self.inner.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl<V> Drop for Cache<V> {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

async fn sweep_loop<V>(inner: Weak<Inner<V>>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let removed = inner.sweep().await;
                if removed > 0 {
                    debug!(removed, "Cache sweep removed expired entries");
                }
            }
        }
    }
}

// =============================================================================
// Glob Matching
// =============================================================================

/// Restricted glob used by [`Cache::delete_pattern`].
///
/// - `*` alone matches every key
/// - A pattern without `*` must equal the key
/// - Otherwise the pattern is split on `*` into literal segments: the first
///   segment anchors at the start of the key, later segments must appear in
///   order after the previous match, and the last segment anchors at the end
///   of the key unless the pattern ends with `*`
pub fn glob_match(pattern: &str, key: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == key;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let last = segments.len() - 1;

    let Some(mut rest) = key.strip_prefix(segments[0]) else {
        return false;
    };

    for (i, segment) in segments.iter().enumerate().skip(1) {
        if segment.is_empty() {
            continue;
        }
        if i == last {
            return rest.ends_with(segment);
        }
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }

    true
}

// =============================================================================
// Tests
// =============================================================================
