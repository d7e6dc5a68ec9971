use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One row per `(request, candidate_index, retry_index)` attempt slot.
///
/// Lifecycle: available -> pending -> (skipped | streaming | success | failed
/// | unused). Every slot ends terminal once the failover engine returns.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_candidates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub request_id: String,
    pub candidate_index: i32,
    pub retry_index: i32,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub key_id: i64,
    pub status: String,
    pub skip_reason: Option<String>,
    pub status_code: Option<i32>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub is_cached: bool,
    /// RPM count observed when the slot changed state.
    pub concurrent_requests: Option<i32>,
    pub latency_ms: Option<i32>,
    pub extra_data: Option<Json>,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
}

impl ActiveModelBehavior for ActiveModel {}
