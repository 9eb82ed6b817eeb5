//! `SeaORM` entities for the reconciliation tables.
//!
//! Owned-record tables (collection items, logs, follows, ...) belong to other
//! services and are only touched through raw owner-column rewrites, so they
//! have no entity here.

pub mod drift_record;
pub mod identity;
pub mod sea_orm_active_enums;
pub mod subscription;
