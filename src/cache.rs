use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::keys::{escape_glob, Invalidation, SEPARATOR};
use crate::traits::KeyValueStore;

/// Statistics for cache operations
#[derive(Debug, Default)]
pub struct CacheStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStatistics {
    /// Get the number of cache hits
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get the number of cache misses
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get the number of keys removed by invalidation
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Calculate the cache hit rate (hits / (hits + misses))
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }
}

/// Read-through cache over a [`KeyValueStore`].
///
/// Values are stored as JSON. A hit returns the stored value without calling
/// the compute function; a miss computes, stores with a TTL and returns.
/// Concurrent misses on one key may each compute; reads must therefore be
/// free of side effects.
pub struct CacheAside<S: KeyValueStore> {
    store: S,
    default_ttl: Duration,
    prefix: Option<String>,
    statistics: CacheStatistics,
}

impl<S: KeyValueStore> CacheAside<S> {
    pub fn new(store: S, default_ttl: Duration) -> Self {
        Self {
            store,
            default_ttl: clamp_ttl(default_ttl),
            prefix: None,
            statistics: CacheStatistics::default(),
        }
    }

    pub fn from_config(store: S, config: &StoreConfig) -> Self {
        let cache = Self::new(store, config.default_ttl);
        match &config.key_prefix {
            Some(prefix) => cache.with_prefix(prefix.clone()),
            None => cache,
        }
    }

    /// Namespaces every key under `prefix:`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn statistics(&self) -> &CacheStatistics {
        &self.statistics
    }

    /// Returns the cached value under `key`, or computes, caches and returns it.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: impl AsRef<str>,
        ttl: Duration,
        compute: F,
    ) -> StoreResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let key = self.namespaced(key.as_ref());

        if let Some(raw) = self.store.get(&key).await? {
            match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    self.statistics.record_hit();
                    debug!("Cache hit for '{}'", key);
                    return Ok(value);
                }
                Err(e) => {
                    warn!("Discarding undecodable cache entry '{}': {}", key, e);
                }
            }
        }

        self.statistics.record_miss();
        debug!("Cache miss for '{}'", key);
        let value = compute().await?;
        let raw = serde_json::to_string(&value)?;
        self.store.set_ex(&key, &raw, clamp_ttl(ttl)).await?;
        Ok(value)
    }

    /// [`CacheAside::get_or_compute`] with the default TTL.
    pub async fn cached<T, F, Fut>(&self, key: impl AsRef<str>, compute: F) -> StoreResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.get_or_compute(key, self.default_ttl, compute).await
    }

    /// Removes one key or every key matching a pattern. Returns how many
    /// keys were deleted; a pattern matching nothing is not an error.
    pub async fn invalidate(&self, target: impl Into<Invalidation>) -> StoreResult<u64> {
        let removed = match target.into() {
            Invalidation::Key(key) => self.store.del(&[self.namespaced(&key)]).await?,
            Invalidation::Pattern(pattern) => {
                let pattern = self.namespaced_pattern(&pattern);
                let keys = self.store.keys(&pattern).await?;
                if keys.is_empty() {
                    0
                } else {
                    self.store.del(&keys).await?
                }
            }
        };
        self.statistics.record_invalidations(removed);
        debug!("Invalidated {} cache keys", removed);
        Ok(removed)
    }

    /// Invalidates every target concurrently and returns the total removed.
    pub async fn invalidate_all(&self, targets: &[Invalidation]) -> StoreResult<u64> {
        let removed = try_join_all(targets.iter().cloned().map(|target| self.invalidate(target))).await?;
        Ok(removed.into_iter().sum())
    }

    fn namespaced(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{SEPARATOR}{key}"),
            None => key.to_string(),
        }
    }

    fn namespaced_pattern(&self, pattern: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}{SEPARATOR}{pattern}", escape_glob(prefix)),
            None => pattern.to_string(),
        }
    }
}

/// TTLs below one second are raised to one second; `SET ... EX 0` is rejected by Redis.
fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.max(Duration::from_secs(1))
}
