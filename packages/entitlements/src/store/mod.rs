//! Record store abstraction
//!
//! The reconciliation core reads and writes through [`EntitlementStore`]:
//! - **PostgreSQL**: via SeaORM entities, the production backend
//! - **Memory**: parking_lot-guarded maps, for tests, local runs and dry-run diffing
//!
//! ## Configuration
//!
//! ```bash
//! ENTITLEMENT_STORE_BACKEND=postgres  # postgres, memory
//! DATABASE_URL=postgres://...
//! ```
//!
//! Writes are always full records. `save_identity` persists the complete flat
//! identity, never a partial diff, so concurrent reconciles of the same
//! identity converge with last-write-wins.

mod memory;
mod postgres;

pub use memory::{MemorySnapshot, MemoryStore};
pub use postgres::SeaOrmStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;

use crate::model::{
    DriftRecord, Identity, OwnedKind, OwnedRecordMove, OwnedRecordRef, Provider, Subscription,
    Tier,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Malformed record: {0}")]
    Malformed(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<sea_orm::DbErr> for StoreError {
    fn from(err: sea_orm::DbErr) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// Filter for listing identities
#[derive(Clone, Debug, Default)]
pub struct IdentityQuery {
    pub include_disabled: bool,
    pub tier: Option<Tier>,
    pub limit: Option<usize>,
}

/// Sync metadata update recorded after a provider round-trip
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncUpdate {
    Ok { at: DateTime<Utc> },
    Failed { at: DateTime<Utc>, error: String },
}

#[async_trait]
pub trait EntitlementStore: Send + Sync + Debug {
    /// Get backend name for logging
    fn backend_name(&self) -> &'static str;

    // ========================================================================
    // Identity operations
    // ========================================================================

    async fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError>;

    /// All identities whose normalized email matches, disabled ones included
    async fn find_identities_by_email(&self, email: &str) -> Result<Vec<Identity>, StoreError>;

    /// Holder of an App Store transaction id. Merged duplicates keep their
    /// identifiers, so a merged holder is returned when no unmerged one
    /// exists; callers follow `merged_into` to the owning identity.
    async fn find_identity_by_app_store_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Identity>, StoreError>;

    /// Ordered by creation time, oldest first
    async fn list_identities(&self, query: IdentityQuery) -> Result<Vec<Identity>, StoreError>;

    /// Normalized emails held by more than one enabled identity
    async fn duplicate_emails(&self) -> Result<Vec<String>, StoreError>;

    async fn insert_identity(&self, identity: &Identity) -> Result<(), StoreError>;

    /// Persist the full identity in the flat current shape
    async fn save_identity(&self, identity: &Identity) -> Result<(), StoreError>;

    async fn record_sync(&self, identity_id: &str, update: SyncUpdate) -> Result<(), StoreError>;

    // ========================================================================
    // Subscription operations
    // ========================================================================

    async fn subscriptions_for_identities(
        &self,
        identity_ids: &[String],
    ) -> Result<Vec<Subscription>, StoreError>;

    /// Rows not linked by id, joined by denormalized owner email
    async fn subscriptions_by_email(
        &self,
        email: &str,
        provider: Provider,
    ) -> Result<Vec<Subscription>, StoreError>;

    async fn get_subscription(
        &self,
        provider: Provider,
        provider_subscription_id: &str,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Insert or replace by (provider, provider subscription id)
    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError>;

    // ========================================================================
    // Owned records
    // ========================================================================

    /// Owner references of `kind` that point at this identity's id, or at its
    /// raw email spelling for email-keyed columns
    async fn list_owned(
        &self,
        kind: OwnedKind,
        identity: &Identity,
    ) -> Result<Vec<OwnedRecordRef>, StoreError>;

    async fn reassign_owned(&self, moves: &[OwnedRecordMove]) -> Result<u64, StoreError>;

    // ========================================================================
    // Drift records
    // ========================================================================

    /// Clear unresolved records for `scope` and store the new findings
    async fn replace_unresolved_drift(
        &self,
        scope: &[String],
        records: &[DriftRecord],
    ) -> Result<(), StoreError>;

    async fn list_drift(&self, only_unresolved: bool) -> Result<Vec<DriftRecord>, StoreError>;
}

/// Backend type for the record store
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

impl StoreBackend {
    pub fn from_env() -> Self {
        match std::env::var("ENTITLEMENT_STORE_BACKEND")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "memory" | "in_memory" | "inmemory" => Self::Memory,
            _ => Self::Postgres,
        }
    }
}

/// Create a store based on environment configuration
pub async fn create_store(
    db: Option<Arc<sea_orm::DatabaseConnection>>,
) -> Result<Arc<dyn EntitlementStore>, StoreError> {
    match StoreBackend::from_env() {
        StoreBackend::Postgres => {
            let db = db.ok_or_else(|| {
                StoreError::Configuration(
                    "Database connection required for Postgres backend".into(),
                )
            })?;
            Ok(Arc::new(SeaOrmStore::new(db)))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory entitlement store, nothing will be persisted");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
