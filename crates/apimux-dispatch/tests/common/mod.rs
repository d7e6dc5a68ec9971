#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use apimux_common::{DispatchSettings, GlobalConfig};
use apimux_provider::{AuthType, ProviderType};
use apimux_ratelimit::AdaptiveState;
use apimux_scheduling::ProviderCandidate;
use apimux_storage::{
    EndpointRow, GlobalConfigRow, GlobalModelRow, KeyRow, ModelRow, NewRequestCandidate,
    ProviderRow, RequestCandidatePatch, Storage, StorageError, StorageResult, StorageSnapshot,
};

#[derive(Debug, Clone)]
pub struct StoredCandidate {
    pub row: NewRequestCandidate,
    pub status: String,
    pub skip_reason: Option<String>,
    pub status_code: Option<i32>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub extra_data: Option<JsonValue>,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
}

/// In-memory stand-in for the SQL layer, keyed the same way.
#[derive(Default)]
pub struct MemoryStorage {
    pub candidates: Mutex<HashMap<String, StoredCandidate>>,
    pub adaptive: Mutex<HashMap<i64, AdaptiveState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Final status per `(candidate_index, retry_index)` slot.
    pub async fn statuses(&self) -> HashMap<(i32, i32), String> {
        self.candidates
            .lock()
            .await
            .values()
            .map(|c| ((c.row.candidate_index, c.row.retry_index), c.status.clone()))
            .collect()
    }

    pub async fn slot(&self, candidate_index: i32, retry_index: i32) -> Option<StoredCandidate> {
        self.candidates
            .lock()
            .await
            .values()
            .find(|c| c.row.candidate_index == candidate_index && c.row.retry_index == retry_index)
            .cloned()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn load_global_config(&self) -> StorageResult<Option<GlobalConfigRow>> {
        Ok(None)
    }

    async fn upsert_global_config(
        &self,
        _config: &GlobalConfig,
        _dispatch: &DispatchSettings,
    ) -> StorageResult<()> {
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        Ok(StorageSnapshot::default())
    }

    async fn insert_request_candidates(&self, rows: &[NewRequestCandidate]) -> StorageResult<()> {
        let mut candidates = self.candidates.lock().await;
        for row in rows {
            candidates.insert(
                row.id.clone(),
                StoredCandidate {
                    row: row.clone(),
                    status: "available".to_string(),
                    skip_reason: None,
                    status_code: None,
                    error_type: None,
                    error_message: None,
                    extra_data: None,
                    started_at: None,
                    finished_at: None,
                },
            );
        }
        Ok(())
    }

    async fn update_request_candidate(
        &self,
        id: &str,
        patch: RequestCandidatePatch,
    ) -> StorageResult<()> {
        let mut candidates = self.candidates.lock().await;
        let stored = candidates
            .get_mut(id)
            .ok_or_else(|| StorageError::Other(format!("record not found: {id}")))?;
        if let Some(status) = patch.status {
            stored.status = status;
        }
        if patch.skip_reason.is_some() {
            stored.skip_reason = patch.skip_reason;
        }
        if patch.status_code.is_some() {
            stored.status_code = patch.status_code;
        }
        if patch.error_type.is_some() {
            stored.error_type = patch.error_type;
        }
        if patch.error_message.is_some() {
            stored.error_message = patch.error_message;
        }
        if patch.extra_data.is_some() {
            stored.extra_data = patch.extra_data;
        }
        if patch.started_at.is_some() {
            stored.started_at = patch.started_at;
        }
        if patch.finished_at.is_some() {
            stored.finished_at = patch.finished_at;
        }
        Ok(())
    }

    async fn save_key_adaptive_state(
        &self,
        key_id: i64,
        state: &AdaptiveState,
    ) -> StorageResult<()> {
        self.adaptive.lock().await.insert(key_id, state.clone());
        Ok(())
    }
}

pub fn provider_row(id: i64) -> ProviderRow {
    ProviderRow {
        id,
        name: format!("prov_{id}"),
        provider_type: ProviderType::Custom,
        is_active: true,
        provider_priority: 1,
        keep_priority_on_conversion: false,
        allow_format_conversion: false,
        proxy: None,
        max_retries: None,
    }
}

pub fn endpoint_row(id: i64, provider_id: i64) -> EndpointRow {
    EndpointRow {
        id,
        provider_id,
        base_url: format!("https://upstream-{id}.example"),
        api_family: "claude".to_string(),
        endpoint_kind: "chat".to_string(),
        is_active: true,
        format_acceptance: None,
    }
}

pub fn key_row(id: i64, provider_id: i64) -> KeyRow {
    KeyRow {
        id,
        provider_id,
        name: Some(format!("key_{id}")),
        secret: "enc:test".to_string(),
        auth_type: AuthType::ApiKey,
        api_formats: None,
        allowed_models: None,
        is_active: true,
        rpm_limit: None,
        internal_priority: 1,
        global_priority_by_format: None,
        oauth_invalid_reason: None,
        adaptive: AdaptiveState::default(),
    }
}

pub fn candidate(index: i64) -> ProviderCandidate {
    ProviderCandidate {
        provider: Arc::new(provider_row(index)),
        endpoint: Arc::new(endpoint_row(index * 10, index)),
        key: Arc::new(key_row(index * 100, index)),
        is_cached: false,
        is_skipped: false,
        skip_reason: None,
        needs_conversion: false,
        provider_api_format: "claude:chat".parse().unwrap(),
        mapping_matched_model: "claude-sonnet".to_string(),
    }
}

pub fn model_row(id: i64, provider_id: i64, global_model_id: i64) -> ModelRow {
    ModelRow {
        id,
        provider_id,
        local_model_id: "claude-sonnet-upstream".to_string(),
        global_model_id: Some(global_model_id),
        is_active: true,
        is_available: None,
    }
}

pub fn global_model_row(id: i64) -> GlobalModelRow {
    GlobalModelRow {
        id,
        name: "claude-sonnet".to_string(),
        is_active: true,
    }
}
