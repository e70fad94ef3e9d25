use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::tasks;

/// Status, headers and body of an upstream response worth keeping
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Cache entry with its absolute expiry
#[derive(Debug)]
pub struct CacheEntry {
    pub response: CachedResponse,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before the entry stops being served, zero once expired.
    pub fn remaining_ttl_at(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    pub fn remaining_ttl(&self) -> Duration {
        self.remaining_ttl_at(Instant::now())
    }
}

/// Key-addressed response store consulted by the gateway.
///
/// Implementations must be safe to call from any number of request tasks at
/// once and must never hand out a partially written entry.
pub trait CacheStore: Send + Sync {
    /// Look up a live entry. Expired entries are removed and reported as a miss.
    fn get(&self, key: &str) -> Option<Arc<CacheEntry>>;

    /// Store a response, replacing whatever was there. Expiry is `now + ttl`.
    fn set(&self, key: String, response: CachedResponse);

    /// Remove one entry, returning whether it existed.
    fn delete(&self, key: &str) -> bool;

    fn clear(&self);

    /// Number of entries currently held, including expired ones not yet swept.
    fn size(&self) -> usize;
}

/// TTL response cache over a sharded concurrent map
pub struct ResponseCache {
    entries: Arc<DashMap<String, Arc<CacheEntry>>>,
    ttl: Duration,
    expired_entries: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        info!("Response cache initialized with TTL: {:?}", ttl);

        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            expired_entries: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub(crate) fn get_at(&self, key: &str, now: Instant) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.get(key).map(|e| e.value().clone())?;

        if entry.is_expired_at(now) {
            // A concurrent set may already have replaced the entry; only drop it if still stale
            if self
                .entries
                .remove_if(key, |_, current| current.is_expired_at(now))
                .is_some()
            {
                self.expired_entries.fetch_add(1, Ordering::Relaxed);
            }
            debug!("Cache MISS (expired) for key: {}", key);
            return None;
        }

        Some(entry)
    }

    pub(crate) fn set_at(&self, key: String, response: CachedResponse, now: Instant) {
        let size = response.body.len();
        let entry = CacheEntry {
            response,
            stored_at: now,
            expires_at: now + self.ttl,
        };

        self.entries.insert(key.clone(), Arc::new(entry));
        debug!("Cache SET for key: {}, TTL: {:?}, size: {} bytes", key, self.ttl, size);
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn remove_expired(&self) -> usize {
        let removed = sweep_expired(&self.entries, Instant::now());
        self.expired_entries.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Start the periodic sweep. Runs until [`ResponseCache::shutdown`] is called.
    pub fn start_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let entries = self.entries.clone();
        let expired_entries = self.expired_entries.clone();

        info!("Cache sweep scheduled every {:?}", every);
        tasks::spawn_periodic("cache-sweep", every, self.shutdown.clone(), move || {
            let removed = sweep_expired(&entries, Instant::now());
            if removed > 0 {
                expired_entries.fetch_add(removed as u64, Ordering::Relaxed);
                debug!(
                    "Cleaned up {} expired cache entries, {} remaining",
                    removed,
                    entries.len()
                );
            }
            metrics::gauge!("gateway_cache_entries").set(entries.len() as f64);
        })
    }

    /// Stop the background sweep.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn statistics(&self) -> serde_json::Value {
        serde_json::json!({
            "entries": self.entries.len(),
            "ttl_seconds": self.ttl.as_secs(),
            "expired_entries": self.expired_entries.load(Ordering::Relaxed),
        })
    }
}

impl CacheStore for ResponseCache {
    fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.get_at(key, Instant::now())
    }

    fn set(&self, key: String, response: CachedResponse) {
        self.set_at(key, response, Instant::now());
    }

    fn delete(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            debug!("Manually removed cache entry: {}", key);
        }
        removed
    }

    fn clear(&self) {
        self.entries.clear();
        info!("Cache cleared");
    }

    fn size(&self) -> usize {
        self.entries.len()
    }
}

fn sweep_expired(entries: &DashMap<String, Arc<CacheEntry>>, now: Instant) -> usize {
    let mut removed = 0;
    entries.retain(|_, entry| {
        if entry.is_expired_at(now) {
            removed += 1;
            false
        } else {
            true
        }
    });
    removed
}
