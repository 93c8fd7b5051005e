//! Fast key/value cache with TTL and atomic set-if-absent.
//!
//! Backs webhook idempotency keys, payment effect locks and done markers, and
//! scheduler task locks. [`MemoryCache`] keeps entries in a `moka` cache with a
//! per-entry TTL. The cache is never authoritative; callers fall back to the
//! database when it reports [`CacheError::Unavailable`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use thiserror::Error;

/// Budget for a single cache call.
pub const CACHE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Store only if absent. True when this call stored the value.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Run a cache call within [`CACHE_TIMEOUT`].
pub async fn bounded<T, F>(call: F) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>>,
{
    tokio::time::timeout(CACHE_TIMEOUT, call)
        .await
        .map_err(|_| CacheError::Unavailable("cache call timed out".into()))?
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache.
pub struct MemoryCache {
    entries: Cache<String, Entry>,
    available: AtomicBool,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.entry_count())
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl MemoryCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(PerEntryTtl)
                .build(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with [`CacheError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("memory cache disabled".into()))
        }
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self.entries.get(key).await.map(|e| e.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.entries
            .insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.check()?;
        let entry = Entry {
            value: value.to_string(),
            ttl,
        };
        let stored = self
            .entries
            .entry(key.to_string())
            .or_insert_with(async move { entry })
            .await;
        Ok(stored.is_fresh())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.entries.invalidate(key).await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_only_first_wins() {
        let cache = MemoryCache::default();
        let ttl = Duration::from_secs(60);
        assert!(cache.set_nx("lock:a", "1", ttl).await.unwrap());
        assert!(!cache.set_nx("lock:a", "2", ttl).await.unwrap());
        assert_eq!(cache.get("lock:a").await.unwrap().as_deref(), Some("1"));

        cache.delete("lock:a").await.unwrap();
        assert!(cache.set_nx("lock:a", "3", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn entries_expire_after_their_ttl() {
        let cache = MemoryCache::default();
        cache
            .set("short", "x", Duration::from_millis(50))
            .await
            .unwrap();
        cache.set("long", "y", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get("short").await.unwrap().is_none());
        assert_eq!(cache.get("long").await.unwrap().as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn unavailable_cache_errors() {
        let cache = MemoryCache::default();
        cache.set_available(false);
        assert!(matches!(
            cache.get("k").await,
            Err(CacheError::Unavailable(_))
        ));
        assert!(bounded(cache.set_nx("k", "v", Duration::from_secs(1))).await.is_err());
    }
}
