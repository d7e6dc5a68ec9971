use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "models")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider_id: i64,
    /// The provider-local model id sent on the wire.
    pub local_model_id: String,
    /// Canonical model this binds to; unmapped models do not route.
    pub global_model_id: Option<i64>,
    pub is_active: bool,
    /// Null is treated as available (legacy rows).
    pub is_available: Option<bool>,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
    #[sea_orm(belongs_to, from = "global_model_id", to = "id", on_delete = "SetNull")]
    pub global_model: HasOne<super::global_models::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
