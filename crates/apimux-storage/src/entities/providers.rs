use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "provider_name")]
    pub name: String,
    pub provider_type: String,
    pub is_active: bool,
    pub provider_priority: i32,
    pub keep_priority_on_conversion: bool,
    pub allow_format_conversion: bool,
    pub proxy: Option<String>,
    pub max_retries: Option<i32>,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub endpoints: HasMany<super::provider_endpoints::Entity>,
    #[sea_orm(has_many)]
    pub keys: HasMany<super::provider_api_keys::Entity>,
    #[sea_orm(has_many)]
    pub provider_models: HasMany<super::models::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
