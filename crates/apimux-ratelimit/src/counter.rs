use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use apimux_cache::{CacheBackend, CacheResult};

const WINDOW_SECONDS: u64 = 60;

/// Per-key request counter over the trailing one-minute bucket.
///
/// Acquired slots are never released; the bucket expires as a whole, which is
/// what makes this an RPM counter rather than a concurrency semaphore.
pub struct RpmCounter {
    cache: Arc<dyn CacheBackend>,
}

impl RpmCounter {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self { cache }
    }

    fn bucket_key(key_id: i64, now: OffsetDateTime) -> String {
        let bucket = now.unix_timestamp().div_euclid(WINDOW_SECONDS as i64);
        format!("rpm:{key_id}:{bucket}")
    }

    /// Requests counted against the key in the current window.
    pub async fn count(&self, key_id: i64, now: OffsetDateTime) -> CacheResult<u32> {
        let value = self.cache.get(&Self::bucket_key(key_id, now)).await?;
        Ok(value
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0))
    }

    /// Atomically claim a slot. `limit=None` counts without enforcing.
    pub async fn acquire(
        &self,
        key_id: i64,
        limit: Option<u32>,
        now: OffsetDateTime,
    ) -> CacheResult<bool> {
        let key = Self::bucket_key(key_id, now);
        let ttl = Duration::from_secs(WINDOW_SECONDS);
        match limit {
            Some(limit) => self.cache.try_acquire(&key, limit as i64, ttl).await,
            None => {
                self.cache.incr(&key, Some(ttl)).await?;
                Ok(true)
            }
        }
    }
}
