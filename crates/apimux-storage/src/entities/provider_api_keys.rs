use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider_id: i64,
    pub name: Option<String>,
    /// Encrypted credential material; decryption happens outside this crate.
    pub secret: String,
    pub auth_type: String,
    /// Supported endpoint signatures. Null means every format of the owning
    /// provider's active endpoints.
    pub api_formats: Option<Json>,
    /// Flat list or `{signature: [model]}` map. Null means unrestricted.
    pub allowed_models: Option<Json>,
    pub is_active: bool,
    /// Fixed operator limit. Null means adaptive learning.
    pub rpm_limit: Option<i32>,
    pub internal_priority: i32,
    pub global_priority_by_format: Option<Json>,
    pub rate_multipliers: Option<Json>,
    pub oauth_invalid_reason: Option<String>,
    // Adaptive learning state, mutated only through the rate-limit manager.
    pub learned_rpm_limit: Option<i32>,
    pub last_rpm_peak: Option<i32>,
    pub last_429_at: Option<OffsetDateTime>,
    pub last_429_kind: Option<String>,
    pub rpm_429_count: i32,
    pub concurrent_429_count: i32,
    pub utilization_samples: Option<Json>,
    pub adjustment_history: Option<Json>,
    pub last_probe_increase_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
