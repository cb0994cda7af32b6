//! Bounded response cache with TTL expiry, LRU eviction and ETag support.
//!
//! Reads are lock-free: `get` only consults sharded maps and never removes
//! entries inline, so a hot read path cannot stall behind eviction. All
//! mutations serialize through one LOW-priority timeout lock, which keeps
//! eviction atomic across the primary and auxiliary maps while remaining
//! subordinate to every other lock in the process hierarchy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::interval;
use tracing::{debug, info, warn};
use veil_memory::{CleanupSeverity, FlushTarget};
use veil_sync::{LockManager, LockPriority, TimeoutLock};

/// Cache tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub default_ttl: Duration,
    pub cleanup_interval: Duration,
    /// Budget for taking the write lock before a mutation is dropped.
    pub write_lock_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
            write_lock_timeout: Duration::from_secs(5),
        }
    }
}

/// A cached HTTP response body plus the metadata needed to replay it.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Vec<u8>,
    pub status: u16,
    pub media_type: String,
    pub headers: Vec<(String, String)>,
    pub etag: Option<String>,
}

struct Entry {
    response: CachedResponse,
    expires_at: Instant,
}

/// Cache hit/miss counters, exported on `/status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub expired_hits: u64,
    pub evictions: u64,
    pub expired_removed: u64,
    pub entries: usize,
}

/// ETag for a response body: hex sha256 of the bytes.
pub fn body_etag(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

pub struct ResponseCache {
    config: CacheConfig,
    entries: DashMap<String, Entry>,
    access_time: DashMap<String, Instant>,
    write_lock: TimeoutLock,
    hits: AtomicU64,
    misses: AtomicU64,
    expired_hits: AtomicU64,
    evictions: AtomicU64,
    expired_removed: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, lock_manager: Arc<LockManager>) -> Arc<Self> {
        let write_lock = TimeoutLock::new(
            "response_cache_write",
            LockPriority::Low,
            config.write_lock_timeout,
            lock_manager,
        );
        Arc::new(Self {
            config,
            entries: DashMap::new(),
            access_time: DashMap::new(),
            write_lock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired_hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_removed: AtomicU64::new(0),
        })
    }

    /// Spawns the periodic expiry sweep for this cache.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        let period = cache.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                // The sweep takes the write lock inside its own holder
                // context, apart from whatever shares its runtime thread.
                let removed = veil_sync::with_lock_context(cache.cleanup_expired()).await;
                if removed > 0 {
                    debug!(removed, "Response cache sweep removed expired entries");
                }
            }
        })
    }

    /// Lock-free read. Expired entries are reported as misses and left for
    /// the sweeper; the access time is touched best-effort.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        match self.entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => {
                self.access_time.insert(key.to_string(), Instant::now());
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.response.clone())
            }
            Some(_) => {
                self.expired_hits.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// ETag of a live entry, if any.
    pub fn etag(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|e| Instant::now() < e.expires_at)
            .and_then(|e| e.response.etag.clone())
    }

    /// Inserts under the write lock. At capacity, expired entries are swept
    /// first; if the cache is still full the least-recently-used entry is
    /// evicted. Returns false when the write lock could not be taken.
    pub async fn set(&self, key: &str, response: CachedResponse, ttl: Option<Duration>) -> bool {
        let Some(_guard) = self.write_lock.acquire(None).await else {
            warn!(key, "Dropping cache write: write lock unavailable");
            return false;
        };

        if self.entries.len() >= self.config.max_entries && !self.entries.contains_key(key) {
            let removed = self.remove_expired_locked();
            if removed == 0 && self.entries.len() >= self.config.max_entries {
                self.evict_lru_locked();
            }
        }

        let expires_at = Instant::now() + ttl.unwrap_or(self.config.default_ttl);
        self.entries
            .insert(key.to_string(), Entry { response, expires_at });
        self.access_time.insert(key.to_string(), Instant::now());
        true
    }

    pub async fn delete(&self, key: &str) -> bool {
        let Some(_guard) = self.write_lock.acquire(None).await else {
            return false;
        };
        let removed = self.entries.remove(key).is_some();
        self.access_time.remove(key);
        removed
    }

    pub async fn clear(&self) {
        let Some(_guard) = self.write_lock.acquire(None).await else {
            warn!("Cache clear skipped: write lock unavailable");
            return;
        };
        let dropped = self.entries.len();
        self.entries.clear();
        self.access_time.clear();
        info!(dropped, "Response cache cleared");
    }

    /// Removes expired entries under the write lock; returns the count.
    pub async fn cleanup_expired(&self) -> usize {
        let Some(_guard) = self.write_lock.acquire(None).await else {
            return 0;
        };
        self.remove_expired_locked()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired_hits: self.expired_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn remove_expired_locked(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now >= e.value().expires_at)
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
            self.access_time.remove(key);
        }
        self.expired_removed
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    fn evict_lru_locked(&self) {
        let victim = self
            .entries
            .iter()
            .map(|e| {
                let last_access = self
                    .access_time
                    .get(e.key())
                    .map(|a| *a.value())
                    .unwrap_or_else(Instant::now);
                (e.key().clone(), last_access)
            })
            .min_by_key(|(_, at)| *at)
            .map(|(key, _)| key);
        if let Some(key) = victim {
            self.entries.remove(&key);
            self.access_time.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Evicted least-recently-used cache entry");
        }
    }
}

impl FlushTarget for ResponseCache {
    fn name(&self) -> &str {
        "response_cache"
    }

    /// Pressure flush drops everything without the write lock; this runs
    /// from the memory monitor where stalling is worse than a lost entry.
    fn flush(&self, _severity: CleanupSeverity) {
        self.entries.clear();
        self.access_time.clear();
    }
}
