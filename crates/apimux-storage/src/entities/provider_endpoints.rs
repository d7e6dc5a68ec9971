use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_endpoints")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider_id: i64,
    pub base_url: String,
    pub api_family: String,
    pub endpoint_kind: String,
    pub is_active: bool,
    /// Optional `FormatAcceptance` config (layer three of the conversion gate).
    pub format_acceptance: Option<Json>,
    pub body_rewrite: Option<Json>,
    pub header_rewrite: Option<Json>,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
