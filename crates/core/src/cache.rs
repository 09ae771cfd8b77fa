//! A single-value cache with a time-to-live.
//!
//! Used for read-mostly shared state such as the tool catalog. The value,
//! the moment it was fetched and the TTL live together behind one
//! `tokio::sync::RwLock`; [`TtlCache::get_or_refresh`] is the only way to
//! change it.

use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

struct CacheEntry<T> {
    value: T,
    fetched_at: Instant,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

pub struct TtlCache<T> {
    entry: RwLock<Option<CacheEntry<T>>>,
    ttl: Duration,
}

impl<T: Clone + Send + Sync> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entry: RwLock::new(None),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached value, if one exists and has not expired.
    pub async fn peek(&self) -> Option<T> {
        let guard = self.entry.read().await;
        guard
            .as_ref()
            .filter(|e| e.is_fresh(self.ttl))
            .map(|e| e.value.clone())
    }

    /// Return the cached value, or run `refresh` and cache its result.
    ///
    /// Concurrent callers that find the value stale wait on the write lock,
    /// so only one refresh runs at a time. A failed refresh leaves the old
    /// entry untouched and returns the error.
    pub async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.peek().await {
            return Ok(value);
        }

        let mut guard = self.entry.write().await;
        if let Some(entry) = guard.as_ref() {
            if entry.is_fresh(self.ttl) {
                return Ok(entry.value.clone());
            }
        }

        let value = refresh().await?;
        *guard = Some(CacheEntry {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value)
    }
}
