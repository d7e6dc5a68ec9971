//! Sticky caller → candidate mapping with TTL.
//!
//! The value is advisory: concurrent writers race last-write-wins, and a
//! mapping whose target left the candidate set is simply ignored by the
//! sorter.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use apimux_cache::{CacheBackend, CacheResult};
use apimux_format::EndpointSignature;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheAffinity {
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub key_id: i64,
    /// Incremented on refresh; lets the reservation layer estimate per-caller
    /// load.
    pub request_count: u64,
}

pub struct CacheAffinityManager {
    cache: Arc<dyn CacheBackend>,
}

fn entry_key(affinity_key: &str, client_format: &EndpointSignature, model_name: &str) -> String {
    format!("affinity:{affinity_key}:{client_format}:{model_name}")
}

impl CacheAffinityManager {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self { cache }
    }

    pub async fn get_affinity(
        &self,
        affinity_key: &str,
        client_format: &EndpointSignature,
        model_name: &str,
    ) -> CacheResult<Option<CacheAffinity>> {
        let raw = self
            .cache
            .get(&entry_key(affinity_key, client_format, model_name))
            .await?;
        Ok(raw.and_then(|value| serde_json::from_str(&value).ok()))
    }

    /// Record (or refresh) the sticky target after a successful request.
    pub async fn set_affinity(
        &self,
        affinity_key: &str,
        client_format: &EndpointSignature,
        model_name: &str,
        provider_id: i64,
        endpoint_id: i64,
        key_id: i64,
        ttl_secs: u64,
    ) -> CacheResult<()> {
        let key = entry_key(affinity_key, client_format, model_name);
        let existing = self
            .cache
            .get(&key)
            .await?
            .and_then(|value| serde_json::from_str::<CacheAffinity>(&value).ok());

        let request_count = match &existing {
            Some(prev)
                if (prev.provider_id, prev.endpoint_id, prev.key_id)
                    == (provider_id, endpoint_id, key_id) =>
            {
                prev.request_count + 1
            }
            _ => 1,
        };

        let entry = CacheAffinity {
            provider_id,
            endpoint_id,
            key_id,
            request_count,
        };
        let serialized = serde_json::to_string(&entry).unwrap_or_default();
        self.cache
            .set(&key, &serialized, Some(Duration::from_secs(ttl_secs)))
            .await
    }

    pub async fn invalidate_affinity(
        &self,
        affinity_key: &str,
        client_format: &EndpointSignature,
        model_name: &str,
    ) -> CacheResult<()> {
        self.cache
            .del(&entry_key(affinity_key, client_format, model_name))
            .await
    }

    /// Drop every affinity entry pointing at a key that became permanently
    /// unusable (deletion, health blackout).
    pub async fn invalidate_key(&self, key_id: i64) -> CacheResult<usize> {
        let mut removed = 0;
        for cache_key in self.cache.scan_pattern("affinity:*").await? {
            let Some(raw) = self.cache.get(&cache_key).await? else {
                continue;
            };
            let Ok(entry) = serde_json::from_str::<CacheAffinity>(&raw) else {
                self.cache.del(&cache_key).await?;
                continue;
            };
            if entry.key_id == key_id {
                self.cache.del(&cache_key).await?;
                removed += 1;
            }
        }
        debug!(key_id, removed, "invalidated affinity entries");
        Ok(removed)
    }
}
