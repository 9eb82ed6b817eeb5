//! PostgreSQL record store using SeaORM
//!
//! Identity, subscription and drift tables go through the generated entities.
//! Owned-record tables belong to other services and are rewritten with raw
//! statements on their declared owner columns only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection, DbErr,
    EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Set, Statement,
    TransactionTrait, sea_query::Expr,
};
use serde_json::Value;
use std::sync::Arc;

use super::{EntitlementStore, IdentityQuery, StoreError, SyncUpdate};
use crate::document::{CURRENT_SCHEMA_VERSION, read_document, write_document};
use crate::entity::{
    drift_record, identity,
    sea_orm_active_enums::{
        DriftSeverity as EntitySeverity, DriftType as EntityDriftType, SyncState as EntitySyncState,
        UserRole,
    },
    subscription,
};
use crate::model::{
    BillingInterval, DriftRecord, DriftType, Identity, OwnedKind, OwnedRecordMove,
    OwnedRecordRef, OwnerKey, Platform, Provider, Role, Severity, Subscription,
    SubscriptionStatus, SyncMeta, SyncState, Tier, normalize_email,
};

#[derive(Debug, Clone)]
pub struct SeaOrmStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

// Conversion helpers
fn to_utc(dt: sea_orm::prelude::DateTime) -> DateTime<Utc> {
    dt.and_utc()
}

fn opt_to_utc(dt: Option<sea_orm::prelude::DateTime>) -> Option<DateTime<Utc>> {
    dt.map(to_utc)
}

fn to_naive(dt: DateTime<Utc>) -> sea_orm::prelude::DateTime {
    dt.naive_utc()
}

fn entity_role_to_type(role: UserRole) -> Role {
    match role {
        UserRole::User => Role::User,
        UserRole::Admin => Role::Admin,
    }
}

fn type_role_to_entity(role: Role) -> UserRole {
    match role {
        Role::User => UserRole::User,
        Role::Admin => UserRole::Admin,
    }
}

fn entity_sync_to_type(state: EntitySyncState) -> SyncState {
    match state {
        EntitySyncState::None => SyncState::None,
        EntitySyncState::Ok => SyncState::Ok,
        EntitySyncState::Error => SyncState::Error,
    }
}

fn type_sync_to_entity(state: SyncState) -> EntitySyncState {
    match state {
        SyncState::None => EntitySyncState::None,
        SyncState::Ok => EntitySyncState::Ok,
        SyncState::Error => EntitySyncState::Error,
    }
}

fn entity_drift_to_type(t: EntityDriftType) -> DriftType {
    match t {
        EntityDriftType::StaleSync => DriftType::StaleSync,
        EntityDriftType::SyncError => DriftType::SyncError,
        EntityDriftType::PaidButFree => DriftType::PaidButFree,
        EntityDriftType::ProviderMismatch => DriftType::ProviderMismatch,
        EntityDriftType::EntitlementMismatch => DriftType::EntitlementMismatch,
    }
}

fn type_drift_to_entity(t: DriftType) -> EntityDriftType {
    match t {
        DriftType::StaleSync => EntityDriftType::StaleSync,
        DriftType::SyncError => EntityDriftType::SyncError,
        DriftType::PaidButFree => EntityDriftType::PaidButFree,
        DriftType::ProviderMismatch => EntityDriftType::ProviderMismatch,
        DriftType::EntitlementMismatch => EntityDriftType::EntitlementMismatch,
    }
}

fn entity_severity_to_type(s: EntitySeverity) -> Severity {
    match s {
        EntitySeverity::Low => Severity::Low,
        EntitySeverity::Medium => Severity::Medium,
        EntitySeverity::High => Severity::High,
    }
}

fn type_severity_to_entity(s: Severity) -> EntitySeverity {
    match s {
        Severity::Low => EntitySeverity::Low,
        Severity::Medium => EntitySeverity::Medium,
        Severity::High => EntitySeverity::High,
    }
}

fn interval_str(interval: BillingInterval) -> &'static str {
    match interval {
        BillingInterval::Month => "month",
        BillingInterval::Year => "year",
    }
}

fn platform_str(platform: Platform) -> &'static str {
    match platform {
        Platform::Web => "web",
        Platform::Ios => "ios",
    }
}

fn identity_model_to_record(m: identity::Model) -> Identity {
    let read = read_document(
        m.entitlement.as_ref().unwrap_or(&Value::Null),
        m.schema_version,
    );
    Identity {
        id: m.id,
        email: m.email,
        display_name: m.display_name,
        role: entity_role_to_type(m.role),
        platform: m.platform.as_deref().and_then(Platform::normalize),
        founding_member: m.founding_member,
        entitlement: read.entitlement,
        billing_provider: m.billing_provider.as_deref().and_then(Provider::normalize),
        stripe_customer_id: m.stripe_customer_id,
        app_store_transaction_id: m.app_store_transaction_id,
        merged_into: m.merged_into,
        disabled: m.disabled,
        sync: SyncMeta {
            state: entity_sync_to_type(m.sync_state),
            last_synced_at: opt_to_utc(m.last_synced_at),
            last_error: m.last_sync_error,
        },
        created_at: to_utc(m.created_at),
        updated_at: to_utc(m.updated_at),
        needs_flatten: read.malformed,
    }
}

fn identity_record_to_active(i: &Identity) -> identity::ActiveModel {
    identity::ActiveModel {
        id: Set(i.id.clone()),
        email: Set(i.email.clone()),
        normalized_email: Set(i.normalized_email()),
        display_name: Set(i.display_name.clone()),
        role: Set(type_role_to_entity(i.role)),
        platform: Set(i.platform.map(|p| platform_str(p).to_string())),
        founding_member: Set(i.founding_member),
        entitlement: Set(Some(write_document(&i.entitlement))),
        schema_version: Set(CURRENT_SCHEMA_VERSION),
        billing_provider: Set(i.billing_provider.map(|p| p.as_str().to_string())),
        stripe_customer_id: Set(i.stripe_customer_id.clone()),
        app_store_transaction_id: Set(i.app_store_transaction_id.clone()),
        merged_into: Set(i.merged_into.clone()),
        disabled: Set(i.disabled),
        last_synced_at: Set(i.sync.last_synced_at.map(to_naive)),
        last_sync_error: Set(i.sync.last_error.clone()),
        sync_state: Set(type_sync_to_entity(i.sync.state)),
        created_at: Set(to_naive(i.created_at)),
        updated_at: Set(to_naive(i.updated_at)),
    }
}

/// Rows with an unrecognized provider are skipped; they cannot be attributed
fn subscription_model_to_record(m: subscription::Model) -> Option<Subscription> {
    let Some(provider) = Provider::normalize(&m.provider) else {
        tracing::warn!(
            subscription_id = %m.id,
            provider = %m.provider,
            "Skipping subscription with unknown provider"
        );
        return None;
    };
    Some(Subscription {
        identity_id: m.identity_id,
        owner_email: m.owner_email,
        provider,
        provider_subscription_id: m.provider_subscription_id,
        customer_id: m.customer_id,
        status: SubscriptionStatus::normalize(&m.status),
        tier: Tier::normalize(&m.tier),
        interval: m.billing_interval.as_deref().and_then(BillingInterval::normalize),
        period_start: opt_to_utc(m.period_start),
        period_end: opt_to_utc(m.period_end),
        cancel_at_period_end: m.cancel_at_period_end,
        first_started_at: opt_to_utc(m.first_started_at),
    })
}

fn drift_model_to_record(m: drift_record::Model) -> DriftRecord {
    DriftRecord {
        id: m.id,
        identity_id: m.identity_id,
        drift_type: entity_drift_to_type(m.drift_type),
        severity: entity_severity_to_type(m.severity),
        detail: m.detail,
        detected_at: to_utc(m.detected_at),
        resolved: m.resolved,
    }
}

/// Resolve a move's column against the kind's declared owner columns so no
/// caller-supplied string reaches the statement text
fn owner_column(kind: OwnedKind, column: &str) -> Result<&'static str, StoreError> {
    kind.owner_fields()
        .iter()
        .find(|f| f.column == column)
        .map(|f| f.column)
        .ok_or_else(|| {
            StoreError::Malformed(format!(
                "{} is not an owner column of {}",
                column,
                kind.table()
            ))
        })
}

#[async_trait]
impl EntitlementStore for SeaOrmStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        let result = identity::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?;

        Ok(result.map(identity_model_to_record))
    }

    async fn find_identities_by_email(&self, email: &str) -> Result<Vec<Identity>, StoreError> {
        let results = identity::Entity::find()
            .filter(identity::Column::NormalizedEmail.eq(normalize_email(email)))
            .order_by_asc(identity::Column::CreatedAt)
            .order_by_asc(identity::Column::Id)
            .all(self.db.as_ref())
            .await?;

        Ok(results.into_iter().map(identity_model_to_record).collect())
    }

    async fn find_identity_by_app_store_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Identity>, StoreError> {
        let holders = identity::Entity::find()
            .filter(identity::Column::AppStoreTransactionId.eq(transaction_id))
            .order_by_asc(identity::Column::Id)
            .all(self.db.as_ref())
            .await?;

        Ok(holders
            .into_iter()
            .map(identity_model_to_record)
            .min_by_key(|i| i.is_merged()))
    }

    async fn list_identities(&self, query: IdentityQuery) -> Result<Vec<Identity>, StoreError> {
        let mut q = identity::Entity::find()
            .order_by_asc(identity::Column::CreatedAt)
            .order_by_asc(identity::Column::Id);

        if !query.include_disabled {
            q = q.filter(identity::Column::Disabled.eq(false));
        }

        // Tier lives inside the document and may be nested, so it is filtered after reading
        if query.tier.is_none()
            && let Some(limit) = query.limit
        {
            q = q.limit(limit as u64);
        }

        let mut identities: Vec<Identity> = q
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(identity_model_to_record)
            .filter(|i| query.tier.is_none_or(|t| i.entitlement.tier == t))
            .collect();

        if let Some(limit) = query.limit {
            identities.truncate(limit);
        }
        Ok(identities)
    }

    async fn duplicate_emails(&self) -> Result<Vec<String>, StoreError> {
        let emails = identity::Entity::find()
            .select_only()
            .column(identity::Column::NormalizedEmail)
            .filter(identity::Column::Disabled.eq(false))
            .filter(identity::Column::MergedInto.is_null())
            .group_by(identity::Column::NormalizedEmail)
            .having(Expr::expr(Expr::col(identity::Column::Id).count()).gt(1))
            .order_by_asc(identity::Column::NormalizedEmail)
            .into_tuple::<String>()
            .all(self.db.as_ref())
            .await?;

        Ok(emails)
    }

    async fn insert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        identity_record_to_active(identity)
            .insert(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn save_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        match identity_record_to_active(identity)
            .update(self.db.as_ref())
            .await
        {
            Ok(_) => Ok(()),
            Err(DbErr::RecordNotUpdated) => {
                Err(StoreError::NotFound(format!("identity {}", identity.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_sync(&self, identity_id: &str, update: SyncUpdate) -> Result<(), StoreError> {
        let existing = identity::Entity::find_by_id(identity_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("identity {}", identity_id)))?;

        let mut model = existing.into_active_model();
        match update {
            SyncUpdate::Ok { at } => {
                model.sync_state = Set(EntitySyncState::Ok);
                model.last_synced_at = Set(Some(to_naive(at)));
                model.last_sync_error = Set(None);
            }
            SyncUpdate::Failed { error, .. } => {
                model.sync_state = Set(EntitySyncState::Error);
                model.last_sync_error = Set(Some(error));
            }
        }
        model.update(self.db.as_ref()).await?;
        Ok(())
    }

    async fn subscriptions_for_identities(
        &self,
        identity_ids: &[String],
    ) -> Result<Vec<Subscription>, StoreError> {
        if identity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let results = subscription::Entity::find()
            .filter(subscription::Column::IdentityId.is_in(identity_ids.iter().cloned()))
            .order_by_asc(subscription::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;

        Ok(results
            .into_iter()
            .filter_map(subscription_model_to_record)
            .collect())
    }

    async fn subscriptions_by_email(
        &self,
        email: &str,
        provider: Provider,
    ) -> Result<Vec<Subscription>, StoreError> {
        let results = subscription::Entity::find()
            .filter(subscription::Column::IdentityId.is_null())
            .filter(Expr::cust_with_values(
                r#"lower(trim("ownerEmail")) = $1"#,
                [normalize_email(email)],
            ))
            .order_by_asc(subscription::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;

        Ok(results
            .into_iter()
            .filter_map(subscription_model_to_record)
            .filter(|s| s.provider == provider)
            .collect())
    }

    async fn get_subscription(
        &self,
        provider: Provider,
        provider_subscription_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let result = subscription::Entity::find()
            .filter(subscription::Column::Provider.eq(provider.as_str()))
            .filter(subscription::Column::ProviderSubscriptionId.eq(provider_subscription_id))
            .one(self.db.as_ref())
            .await?;

        Ok(result.and_then(subscription_model_to_record))
    }

    async fn upsert_subscription(&self, sub: &Subscription) -> Result<(), StoreError> {
        let now = Utc::now().naive_utc();
        let existing = subscription::Entity::find()
            .filter(subscription::Column::Provider.eq(sub.provider.as_str()))
            .filter(subscription::Column::ProviderSubscriptionId.eq(&sub.provider_subscription_id))
            .one(self.db.as_ref())
            .await?;

        let (id, created_at) = match &existing {
            Some(row) => (row.id.clone(), row.created_at),
            None => (uuid::Uuid::new_v4().to_string(), now),
        };

        let model = subscription::ActiveModel {
            id: Set(id),
            identity_id: Set(sub.identity_id.clone()),
            owner_email: Set(sub.owner_email.clone()),
            provider: Set(sub.provider.as_str().to_string()),
            provider_subscription_id: Set(sub.provider_subscription_id.clone()),
            customer_id: Set(sub.customer_id.clone()),
            status: Set(sub.status.as_str().to_string()),
            tier: Set(sub.tier.as_str().to_string()),
            billing_interval: Set(sub.interval.map(|i| interval_str(i).to_string())),
            period_start: Set(sub.period_start.map(to_naive)),
            period_end: Set(sub.period_end.map(to_naive)),
            cancel_at_period_end: Set(sub.cancel_at_period_end),
            first_started_at: Set(sub.first_started_at.map(to_naive)),
            created_at: Set(created_at),
            updated_at: Set(now),
        };

        if existing.is_some() {
            model.update(self.db.as_ref()).await?;
        } else {
            model.insert(self.db.as_ref()).await?;
        }
        Ok(())
    }

    async fn list_owned(
        &self,
        kind: OwnedKind,
        identity: &Identity,
    ) -> Result<Vec<OwnedRecordRef>, StoreError> {
        let mut refs = Vec::new();

        for field in kind.owner_fields() {
            let value = match field.key {
                OwnerKey::Id => identity.id.clone(),
                OwnerKey::Email => identity.email.clone(),
            };
            let sql = format!(
                r#"SELECT "id" FROM "public"."{}" WHERE "{}" = $1"#,
                kind.table(),
                field.column
            );
            let rows = self
                .db
                .query_all(Statement::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    sql,
                    [value.clone().into()],
                ))
                .await?;

            for row in rows {
                let record_id: String = row.try_get("", "id")?;
                refs.push(OwnedRecordRef {
                    kind,
                    record_id,
                    column: field.column,
                    value: value.clone(),
                });
            }
        }

        Ok(refs)
    }

    async fn reassign_owned(&self, moves: &[OwnedRecordMove]) -> Result<u64, StoreError> {
        if moves.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin().await?;
        let mut moved = 0;

        for mv in moves {
            let column = owner_column(mv.kind, &mv.column)?;
            let sql = format!(
                r#"UPDATE "public"."{table}" SET "{column}" = $1 WHERE "id" = $2 AND "{column}" = $3"#,
                table = mv.kind.table(),
                column = column
            );
            let result = txn
                .execute(Statement::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    sql,
                    [
                        mv.to.clone().into(),
                        mv.record_id.clone().into(),
                        mv.from.clone().into(),
                    ],
                ))
                .await?;
            moved += result.rows_affected();
        }

        txn.commit().await?;
        Ok(moved)
    }

    async fn replace_unresolved_drift(
        &self,
        scope: &[String],
        records: &[DriftRecord],
    ) -> Result<(), StoreError> {
        let txn = self.db.begin().await?;

        if !scope.is_empty() {
            drift_record::Entity::delete_many()
                .filter(drift_record::Column::Resolved.eq(false))
                .filter(drift_record::Column::IdentityId.is_in(scope.iter().cloned()))
                .exec(&txn)
                .await?;
        }

        if !records.is_empty() {
            let models: Vec<drift_record::ActiveModel> = records
                .iter()
                .map(|r| drift_record::ActiveModel {
                    id: Set(r.id.clone()),
                    identity_id: Set(r.identity_id.clone()),
                    drift_type: Set(type_drift_to_entity(r.drift_type)),
                    severity: Set(type_severity_to_entity(r.severity)),
                    detail: Set(r.detail.clone()),
                    detected_at: Set(to_naive(r.detected_at)),
                    resolved: Set(r.resolved),
                })
                .collect();
            drift_record::Entity::insert_many(models).exec(&txn).await?;
        }

        txn.commit().await?;
        Ok(())
    }

    async fn list_drift(&self, only_unresolved: bool) -> Result<Vec<DriftRecord>, StoreError> {
        let mut q = drift_record::Entity::find()
            .order_by_asc(drift_record::Column::IdentityId)
            .order_by_asc(drift_record::Column::DetectedAt);

        if only_unresolved {
            q = q.filter(drift_record::Column::Resolved.eq(false));
        }

        let results = q.all(self.db.as_ref()).await?;
        Ok(results.into_iter().map(drift_model_to_record).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entitlement, Level};
    use chrono::TimeZone;
    use serde_json::json;

    fn model(entitlement: Option<Value>, schema_version: i32) -> identity::Model {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().naive_utc();
        identity::Model {
            id: "id-1".into(),
            email: "Someone@Example.com".into(),
            normalized_email: "someone@example.com".into(),
            display_name: None,
            role: UserRole::User,
            platform: Some("iOS".into()),
            founding_member: false,
            entitlement,
            schema_version,
            billing_provider: Some("Apple".into()),
            stripe_customer_id: None,
            app_store_transaction_id: Some("tx-1".into()),
            merged_into: None,
            disabled: false,
            last_synced_at: None,
            last_sync_error: None,
            sync_state: EntitySyncState::None,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn test_identity_model_normalizes_text_columns() {
        let identity = identity_model_to_record(model(
            Some(json!({"tier": "premium", "level": "paid", "status": "active"})),
            CURRENT_SCHEMA_VERSION,
        ));
        assert_eq!(identity.platform, Some(Platform::Ios));
        assert_eq!(identity.billing_provider, Some(Provider::AppStore));
        assert_eq!(identity.entitlement.tier, Tier::Premium);
        assert!(!identity.needs_flatten);
    }

    #[test]
    fn test_identity_write_always_uses_current_schema() {
        let identity = identity_model_to_record(model(
            Some(json!({"entitlement": {"tier": "pro"}})),
            1,
        ));
        assert!(identity.needs_flatten);

        let active = identity_record_to_active(&identity);
        assert_eq!(active.schema_version, Set(CURRENT_SCHEMA_VERSION));
        let expected = Entitlement {
            tier: Tier::Pro,
            level: Level::Paid,
            status: Default::default(),
            subscription_provider: None,
        };
        assert_eq!(active.entitlement, Set(Some(write_document(&expected))));
    }

    #[test]
    fn test_owner_column_rejects_undeclared_columns() {
        assert_eq!(
            owner_column(OwnedKind::Comment, "authorEmail").unwrap(),
            "authorEmail"
        );
        assert!(owner_column(OwnedKind::Comment, "body\"; DROP TABLE").is_err());
    }

    #[test]
    fn test_unknown_provider_rows_are_skipped() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().naive_utc();
        let row = subscription::Model {
            id: "s".into(),
            identity_id: None,
            owner_email: None,
            provider: "paypal".into(),
            provider_subscription_id: "p".into(),
            customer_id: None,
            status: "active".into(),
            tier: "pro".into(),
            billing_interval: None,
            period_start: None,
            period_end: None,
            cancel_at_period_end: false,
            first_started_at: None,
            created_at: ts,
            updated_at: ts,
        };
        assert!(subscription_model_to_record(row).is_none());
    }
}
