//! Enums written only by this service. Values edited by hand or reported by
//! providers (tiers, statuses, provider names) stay `Text` columns and are
//! normalized on read.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "UserRole")]
pub enum UserRole {
    #[sea_orm(string_value = "USER")]
    User,
    #[sea_orm(string_value = "ADMIN")]
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "SyncState")]
pub enum SyncState {
    #[sea_orm(string_value = "NONE")]
    None,
    #[sea_orm(string_value = "OK")]
    Ok,
    #[sea_orm(string_value = "ERROR")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "DriftType")]
pub enum DriftType {
    #[sea_orm(string_value = "STALE_SYNC")]
    StaleSync,
    #[sea_orm(string_value = "SYNC_ERROR")]
    SyncError,
    #[sea_orm(string_value = "PAID_BUT_FREE")]
    PaidButFree,
    #[sea_orm(string_value = "PROVIDER_MISMATCH")]
    ProviderMismatch,
    #[sea_orm(string_value = "ENTITLEMENT_MISMATCH")]
    EntitlementMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "DriftSeverity")]
pub enum DriftSeverity {
    #[sea_orm(string_value = "LOW")]
    Low,
    #[sea_orm(string_value = "MEDIUM")]
    Medium,
    #[sea_orm(string_value = "HIGH")]
    High,
}
