//! `SeaORM` Entity for provider subscriptions
//!
//! Unique on (`provider`, `providerSubscriptionId`). Rows are never deleted;
//! cancellation moves `status` to canceled/expired.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "Subscription")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,
    #[sea_orm(column_name = "identityId", column_type = "Text", nullable)]
    pub identity_id: Option<String>,
    /// Denormalized owner email, fallback join key for unlinked legacy rows
    #[sea_orm(column_name = "ownerEmail", column_type = "Text", nullable)]
    pub owner_email: Option<String>,
    #[sea_orm(column_type = "Text")]
    pub provider: String,
    #[sea_orm(column_name = "providerSubscriptionId", column_type = "Text")]
    pub provider_subscription_id: String,
    #[sea_orm(column_name = "customerId", column_type = "Text", nullable)]
    pub customer_id: Option<String>,
    #[sea_orm(column_type = "Text")]
    pub status: String,
    #[sea_orm(column_type = "Text")]
    pub tier: String,
    #[sea_orm(column_name = "billingInterval", column_type = "Text", nullable)]
    pub billing_interval: Option<String>,
    #[sea_orm(column_name = "periodStart", nullable)]
    pub period_start: Option<DateTime>,
    #[sea_orm(column_name = "periodEnd", nullable)]
    pub period_end: Option<DateTime>,
    #[sea_orm(column_name = "cancelAtPeriodEnd", default_value = false)]
    pub cancel_at_period_end: bool,
    /// Immutable once set, used for grandfathering
    #[sea_orm(column_name = "firstStartedAt", nullable)]
    pub first_started_at: Option<DateTime>,
    #[sea_orm(column_name = "createdAt")]
    pub created_at: DateTime,
    #[sea_orm(column_name = "updatedAt")]
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::identity::Entity",
        from = "Column::IdentityId",
        to = "super::identity::Column::Id",
        on_update = "Cascade",
        on_delete = "SetNull"
    )]
    Identity,
}

impl Related<super::identity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Identity.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
