//! Cache backend contract shared by the affinity manager and the RPM guard.
//!
//! Authoritative counters and sticky mappings live in an external KV system
//! in a clustered deployment; the in-memory backend here serves single-node
//! deployments and tests. The contract deliberately includes an atomic slot
//! acquisition so limits are enforced without read-modify-write races.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache value for '{key}' is not numeric")]
    NotNumeric { key: String },
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Increment a numeric value, creating it at 1. A `ttl` applies only when
    /// the key is created by this call (the window start fixes the deadline).
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> CacheResult<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()>;

    async fn del(&self, key: &str) -> CacheResult<()>;

    /// Keys matching a `prefix*` pattern.
    async fn scan_pattern(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Atomic compare-and-increment: acquire one slot iff the current count is
    /// below `limit`. Returns false without mutating on a full window.
    async fn try_acquire(&self, key: &str, limit: i64, ttl: Duration) -> CacheResult<bool>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// Single-process backend: one mutex makes every operation atomic.
#[derive(Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn numeric(entry: Option<&Entry>, key: &str, now: Instant) -> CacheResult<i64> {
        match entry {
            Some(entry) if entry.live(now) => entry
                .value
                .parse::<i64>()
                .map_err(|_| CacheError::NotNumeric {
                    key: key.to_string(),
                }),
            _ => Ok(0),
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> CacheResult<i64> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let current = Self::numeric(entries.get(key), key, now)?;
        let next = current + 1;
        let expires_at = match entries.get(key) {
            Some(entry) if entry.live(now) => entry.expires_at,
            _ => ttl.map(|ttl| now + ttl),
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key)
            && entry.live(now)
        {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn scan_pattern(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| entry.live(now) && key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn try_acquire(&self, key: &str, limit: i64, ttl: Duration) -> CacheResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let current = Self::numeric(entries.get(key), key, now)?;
        if current >= limit {
            return Ok(false);
        }
        let expires_at = match entries.get(key) {
            Some(entry) if entry.live(now) => entry.expires_at,
            _ => Some(now + ttl),
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: (current + 1).to_string(),
                expires_at,
            },
        );
        Ok(true)
    }
}
