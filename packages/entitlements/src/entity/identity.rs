//! `SeaORM` Entity for user identities

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "Identity")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,
    /// Stored as entered; compare through `normalizedEmail`
    #[sea_orm(column_type = "Text")]
    pub email: String,
    #[sea_orm(column_name = "normalizedEmail", column_type = "Text")]
    pub normalized_email: String,
    #[sea_orm(column_name = "displayName", column_type = "Text", nullable)]
    pub display_name: Option<String>,
    pub role: super::sea_orm_active_enums::UserRole,
    #[sea_orm(column_type = "Text", nullable)]
    pub platform: Option<String>,
    #[sea_orm(column_name = "foundingMember", default_value = false)]
    pub founding_member: bool,
    /// Flat entitlement document, see `crate::document`
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub entitlement: Option<Json>,
    #[sea_orm(column_name = "schemaVersion", default_value = 1)]
    pub schema_version: i32,
    #[sea_orm(column_name = "billingProvider", column_type = "Text", nullable)]
    pub billing_provider: Option<String>,
    #[sea_orm(column_name = "stripeCustomerId", column_type = "Text", nullable)]
    pub stripe_customer_id: Option<String>,
    #[sea_orm(column_name = "appStoreTransactionId", column_type = "Text", nullable)]
    pub app_store_transaction_id: Option<String>,
    #[sea_orm(column_name = "mergedInto", column_type = "Text", nullable)]
    pub merged_into: Option<String>,
    #[sea_orm(default_value = false)]
    pub disabled: bool,
    #[sea_orm(column_name = "lastSyncedAt", nullable)]
    pub last_synced_at: Option<DateTime>,
    #[sea_orm(column_name = "lastSyncError", column_type = "Text", nullable)]
    pub last_sync_error: Option<String>,
    #[sea_orm(column_name = "syncState")]
    pub sync_state: super::sea_orm_active_enums::SyncState,
    #[sea_orm(column_name = "createdAt")]
    pub created_at: DateTime,
    #[sea_orm(column_name = "updatedAt")]
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::subscription::Entity")]
    Subscription,
    #[sea_orm(has_many = "super::drift_record::Entity")]
    DriftRecord,
}

impl Related<super::subscription::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subscription.def()
    }
}

impl Related<super::drift_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DriftRecord.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
