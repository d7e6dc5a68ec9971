use async_trait::async_trait;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use apimux_common::{DispatchSettings, GlobalConfig};
use apimux_ratelimit::AdaptiveState;

use crate::snapshot::{GlobalConfigRow, StorageSnapshot};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Other(String),
}

/// Insert shape for one pre-created audit slot.
#[derive(Debug, Clone)]
pub struct NewRequestCandidate {
    pub id: String,
    pub request_id: String,
    pub candidate_index: i32,
    pub retry_index: i32,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub key_id: i64,
    pub is_cached: bool,
    pub created_at: OffsetDateTime,
}

/// Partial column update for an audit slot; `None` fields stay untouched.
#[derive(Debug, Clone, Default)]
pub struct RequestCandidatePatch {
    pub status: Option<String>,
    pub skip_reason: Option<String>,
    pub status_code: Option<i32>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub concurrent_requests: Option<i32>,
    pub latency_ms: Option<i32>,
    pub extra_data: Option<JsonValue>,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
}

/// Storage is used for:
/// - bootstrap (schema sync + `load_snapshot`)
/// - audit rows (`request_candidates` insert/update)
/// - adaptive-state writeback on provider keys
///
/// Runtime dispatch reads must NOT hit the DB; they read in-memory snapshots.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync. Enabled by default at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    async fn load_global_config(&self) -> StorageResult<Option<GlobalConfigRow>>;
    async fn upsert_global_config(
        &self,
        config: &GlobalConfig,
        dispatch: &DispatchSettings,
    ) -> StorageResult<()>;

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot>;

    async fn insert_request_candidates(
        &self,
        rows: &[NewRequestCandidate],
    ) -> StorageResult<()>;

    async fn update_request_candidate(
        &self,
        id: &str,
        patch: RequestCandidatePatch,
    ) -> StorageResult<()>;

    /// Write back the bounded adaptive-learning state onto the key row.
    async fn save_key_adaptive_state(
        &self,
        key_id: i64,
        state: &AdaptiveState,
    ) -> StorageResult<()>;
}
