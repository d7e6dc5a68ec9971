use std::collections::HashMap;

use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Rolling per-key health bookkeeping. Diagnostic only; availability gating
/// is the scheduler's job.
#[derive(Debug, Clone, Default)]
pub struct KeyHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_latency_ms: Option<u64>,
    pub last_success_at: Option<OffsetDateTime>,
    pub last_failure_at: Option<OffsetDateTime>,
}

#[derive(Default)]
pub struct HealthMonitor {
    keys: RwLock<HashMap<i64, KeyHealth>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_success(&self, key_id: i64, latency_ms: u64, now: OffsetDateTime) {
        let mut keys = self.keys.write().await;
        let entry = keys.entry(key_id).or_default();
        entry.success_count += 1;
        entry.last_latency_ms = Some(latency_ms);
        entry.last_success_at = Some(now);
    }

    pub async fn record_failure(&self, key_id: i64, now: OffsetDateTime) {
        let mut keys = self.keys.write().await;
        let entry = keys.entry(key_id).or_default();
        entry.failure_count += 1;
        entry.last_failure_at = Some(now);
    }

    pub async fn snapshot(&self, key_id: i64) -> Option<KeyHealth> {
        self.keys.read().await.get(&key_id).cloned()
    }
}
