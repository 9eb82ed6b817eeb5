//! `SeaORM` Entity for drift detector findings

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "DriftRecord")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,
    #[sea_orm(column_name = "identityId", column_type = "Text")]
    pub identity_id: String,
    #[sea_orm(column_name = "driftType")]
    pub drift_type: super::sea_orm_active_enums::DriftType,
    pub severity: super::sea_orm_active_enums::DriftSeverity,
    #[sea_orm(column_type = "Text")]
    pub detail: String,
    #[sea_orm(column_name = "detectedAt")]
    pub detected_at: DateTime,
    #[sea_orm(default_value = false)]
    pub resolved: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::identity::Entity",
        from = "Column::IdentityId",
        to = "super::identity::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Identity,
}

impl Related<super::identity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Identity.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
