use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "global_models")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "global_model_name")]
    pub name: String,
    pub display_name: Option<String>,
    pub is_active: bool,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub bound_models: HasMany<super::models::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
