//! Read-through cache with TTL and explicit invalidation.
//!
//! ```text
//! ┌─────────────┐  get_or_compute   ┌──────────────┐   get/set/del   ┌──────────────┐
//! │ ListService │ ────────────────► │ CacheService │ ──────────────► │ CacheAdapter │
//! └─────────────┘  invalidate       └──────┬───────┘                 │ Memory|Redis │
//!                                          │ failures                └──────────────┘
//!                                          ▼
//!                                     ┌──────────┐
//!                                     │ Reporter │
//!                                     └──────────┘
//! ```
//!
//! Values are stored as JSON text on every backend. A cache failure never
//! reaches the caller: reads fall through to `compute`, writes and
//! invalidations are reported and dropped.
//!
//! Every key carries an invalidation generation. A fill whose `compute`
//! overlapped an `invalidate` of the same key is removed again, so a
//! snapshot read before a write never outlives that write's invalidation.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::report::SharedReporter;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// Default entry lifetime: 10 minutes.
pub const DEFAULT_TTL_SECS: u64 = 600;

/// Cache backend errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),
    #[error("Cache codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Key/value backend. `ttl_secs` of `None` or `0` means no expiry.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: String, ttl_secs: Option<u64>) -> Result<(), CacheError>;
    async fn invalidate(&self, key: &str) -> Result<(), CacheError>;
}

/// Cache key of a list's ordered tree.
pub fn list_key(public_id: &Uuid) -> String {
    format!("list:{public_id}")
}

/// Cache key of an ordered forest computed from a given flat item set.
pub fn tree_key(fingerprint: u32) -> String {
    format!("items:{fingerprint:08x}")
}

/// Checksum of the serialized value. Not collision resistant; a collision
/// is served as a hit.
pub fn fingerprint<T: Serialize>(value: &T) -> Option<u32> {
    serde_json::to_vec(value).ok().map(|bytes| crc32fast::hash(&bytes))
}

/// Counters for monitoring cache health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub failures: u64,
}

#[derive(Default)]
struct AtomicCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    failures: AtomicU64,
}

/// Read-through cache front end used by the list service.
pub struct CacheService {
    adapter: Arc<dyn CacheAdapter>,
    ttl_secs: u64,
    reporter: SharedReporter,
    stats: AtomicCacheStats,
    /// Invalidation count per key; absent means zero
    generations: Mutex<HashMap<String, u64>>,
}

impl CacheService {
    pub fn new(adapter: Arc<dyn CacheAdapter>, ttl_secs: u64, reporter: SharedReporter) -> Self {
        Self {
            adapter,
            ttl_secs,
            reporter,
            stats: AtomicCacheStats::default(),
            generations: Mutex::new(HashMap::new()),
        }
    }

    /// In-process cache with the default TTL.
    pub fn in_memory(reporter: SharedReporter) -> Self {
        Self::new(Arc::new(MemoryCache::new()), DEFAULT_TTL_SECS, reporter)
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Return the cached value for `key`, or run `compute`, store its
    /// result and return it. Errors from `compute` are returned and not
    /// cached, and neither is a value computed while `key` was invalidated.
    pub async fn get_or_compute<T, E, F, Fut>(&self, key: &str, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.generation(key).await;

        match self.adapter.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    self.reporter.breadcrumb("cache", &format!("cache HIT: {key}"));
                    log::debug!("Cache hit for {key}");
                    return Ok(value);
                }
                Err(e) => self.fail(key, CacheError::from(e)),
            },
            Ok(None) => {}
            Err(e) => self.fail(key, e),
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        self.reporter.breadcrumb("cache", &format!("cache MISS: {key}"));
        log::debug!("Cache miss for {key}");

        let value = compute().await?;

        if self.generation(key).await != generation {
            log::debug!("{key} invalidated during compute, not storing");
            return Ok(value);
        }
        let raw = match serde_json::to_string(&value) {
            Ok(raw) => raw,
            Err(e) => {
                self.fail(key, CacheError::from(e));
                return Ok(value);
            }
        };
        if let Err(e) = self.adapter.set(key, raw, Some(self.ttl_secs)).await {
            self.fail(key, e);
            return Ok(value);
        }

        // An invalidate may have run between the check and the store.
        if self.generation(key).await != generation {
            log::debug!("{key} invalidated while storing, dropping entry");
            if let Err(e) = self.adapter.invalidate(key).await {
                self.fail(key, e);
            }
        }
        Ok(value)
    }

    async fn generation(&self, key: &str) -> u64 {
        self.generations.lock().await.get(key).copied().unwrap_or(0)
    }

    /// Drop `key`. Completes before returning; failures are reported only.
    pub async fn invalidate(&self, key: &str) {
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        self.reporter.breadcrumb("cache", &format!("invalidate cache: {key}"));
        // Bump before deleting: a fill that stores after the delete sees it.
        *self.generations.lock().await.entry(key.to_string()).or_insert(0) += 1;
        if let Err(e) = self.adapter.invalidate(key).await {
            self.fail(key, e);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }

    fn fail(&self, key: &str, error: CacheError) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        log::warn!("Cache failure for {key}: {error}");
        self.reporter.capture(&error);
    }
}
