//! Per-key adaptive state residency.
//!
//! The authoritative copy lives on the key row as bounded JSON; the runtime
//! mutates an in-memory copy under a per-key lock and writes back
//! best-effort after each mutation. The learning algorithm tolerates about a
//! second of staleness, so a lost write is never fatal.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use apimux_ratelimit::{
    AdaptiveRpmManager, AdaptiveState, AdjustmentStats, RateLimitInfo,
};
use apimux_storage::{Storage, StorageSnapshot};

pub struct KeyStateStore {
    storage: Arc<dyn Storage>,
    states: RwLock<HashMap<i64, Arc<Mutex<AdaptiveState>>>>,
}

impl KeyStateStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Seed in-memory state from a freshly loaded snapshot.
    pub async fn load_snapshot(&self, snapshot: &StorageSnapshot) {
        let mut states = self.states.write().await;
        for key in &snapshot.keys {
            states
                .entry(key.id)
                .or_insert_with(|| Arc::new(Mutex::new(key.adaptive.clone())));
        }
    }

    pub async fn entry(&self, key_id: i64) -> Arc<Mutex<AdaptiveState>> {
        if let Some(state) = self.states.read().await.get(&key_id) {
            return state.clone();
        }
        let mut states = self.states.write().await;
        states
            .entry(key_id)
            .or_insert_with(|| Arc::new(Mutex::new(AdaptiveState::default())))
            .clone()
    }

    async fn persist(&self, key_id: i64, state: &AdaptiveState) {
        if let Err(err) = self.storage.save_key_adaptive_state(key_id, state).await {
            warn!(key_id, error = %err, "failed to persist adaptive state");
        }
    }
}

/// The adaptive RPM manager bound to the state store: one entry point for
/// 429 observations and success bookkeeping, with writeback.
pub struct AdaptiveService {
    manager: AdaptiveRpmManager,
    store: KeyStateStore,
}

impl AdaptiveService {
    pub fn new(manager: AdaptiveRpmManager, store: KeyStateStore) -> Self {
        Self { manager, store }
    }

    pub fn manager(&self) -> &AdaptiveRpmManager {
        &self.manager
    }

    pub async fn state_copy(&self, key_id: i64) -> AdaptiveState {
        self.store.entry(key_id).await.lock().await.clone()
    }

    pub async fn handle_429(
        &self,
        key_id: i64,
        fixed_rpm_limit: Option<u32>,
        info: &RateLimitInfo,
        current_rpm: Option<u32>,
        now: OffsetDateTime,
    ) -> Option<u32> {
        let entry = self.store.entry(key_id).await;
        let mut state = entry.lock().await;
        let result = self
            .manager
            .handle_429(&mut state, fixed_rpm_limit, info, current_rpm, now);
        self.store.persist(key_id, &state).await;
        result
    }

    pub async fn handle_success(
        &self,
        key_id: i64,
        fixed_rpm_limit: Option<u32>,
        current_rpm: u32,
        now: OffsetDateTime,
    ) -> Option<u32> {
        let entry = self.store.entry(key_id).await;
        let mut state = entry.lock().await;
        let outcome = self
            .manager
            .handle_success(&mut state, fixed_rpm_limit, current_rpm, now);
        if outcome.new_limit.is_some() || outcome.should_persist {
            self.store.persist(key_id, &state).await;
        }
        outcome.new_limit
    }

    /// Operator reset: wipe everything learned for a key.
    pub async fn reset_learning(&self, key_id: i64) {
        let entry = self.store.entry(key_id).await;
        let mut state = entry.lock().await;
        self.manager.reset_learning(&mut state);
        self.store.persist(key_id, &state).await;
    }

    pub async fn stats(
        &self,
        key_id: i64,
        fixed_rpm_limit: Option<u32>,
        now: OffsetDateTime,
    ) -> AdjustmentStats {
        let state = self.state_copy(key_id).await;
        self.manager.adjustment_stats(&state, fixed_rpm_limit, now)
    }
}
