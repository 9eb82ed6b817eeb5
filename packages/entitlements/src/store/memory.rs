//! In-memory record store
//!
//! Used by tests and local runs. Identities are kept as raw documents and go
//! through the same read normalization as the Postgres backend, so legacy
//! nested shapes can be seeded with [`MemoryStore::insert_raw_identity`].

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{EntitlementStore, IdentityQuery, StoreError, SyncUpdate};
use crate::document::{CURRENT_SCHEMA_VERSION, read_document, write_document};
use crate::model::{
    DriftRecord, Identity, OwnedKind, OwnedRecordMove, OwnedRecordRef, OwnerKey, Provider,
    Subscription, SyncState, normalize_email,
};

#[derive(Clone, Debug, PartialEq)]
struct StoredIdentity {
    identity: Identity,
    document: Value,
    schema_version: i32,
}

impl StoredIdentity {
    fn load(&self) -> Identity {
        let read = read_document(&self.document, self.schema_version);
        let mut identity = self.identity.clone();
        identity.entitlement = read.entitlement;
        identity.needs_flatten = read.malformed;
        identity
    }
}

/// Owner columns of one owned record
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnedRow {
    pub owners: BTreeMap<&'static str, String>,
}

/// Comparable copy of the whole store, used to prove dry runs touch nothing
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemorySnapshot {
    identities: BTreeMap<String, StoredIdentity>,
    subscriptions: BTreeMap<(Provider, String), Subscription>,
    owned: BTreeMap<(OwnedKind, String), OwnedRow>,
    drift: BTreeMap<String, DriftRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemorySnapshot>>,
}

fn subscription_record_id(provider: Provider, provider_subscription_id: &str) -> String {
    format!("{}:{}", provider.as_str(), provider_subscription_id)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        self.inner.read().clone()
    }

    /// Seed an identity with an arbitrary stored entitlement document
    pub fn insert_raw_identity(&self, identity: Identity, document: Value, schema_version: i32) {
        self.inner.write().identities.insert(
            identity.id.clone(),
            StoredIdentity {
                identity,
                document,
                schema_version,
            },
        );
    }

    pub fn raw_document(&self, identity_id: &str) -> Option<(Value, i32)> {
        self.inner
            .read()
            .identities
            .get(identity_id)
            .map(|s| (s.document.clone(), s.schema_version))
    }

    pub fn add_owned(&self, kind: OwnedKind, record_id: &str, owners: &[(&'static str, &str)]) {
        let row = OwnedRow {
            owners: owners
                .iter()
                .map(|(column, value)| (*column, value.to_string()))
                .collect(),
        };
        self.inner
            .write()
            .owned
            .insert((kind, record_id.to_string()), row);
    }

    /// Record ids of `kind` whose `column` holds `value`
    pub fn owned_by(&self, kind: OwnedKind, column: &str, value: &str) -> Vec<String> {
        self.inner
            .read()
            .owned
            .iter()
            .filter(|((k, _), row)| *k == kind && row.owners.get(column).map(|v| v.as_str()) == Some(value))
            .map(|((_, id), _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self.inner.read().identities.get(id).map(StoredIdentity::load))
    }

    async fn find_identities_by_email(&self, email: &str) -> Result<Vec<Identity>, StoreError> {
        let email = normalize_email(email);
        let mut found: Vec<Identity> = self
            .inner
            .read()
            .identities
            .values()
            .filter(|s| s.identity.normalized_email() == email)
            .map(StoredIdentity::load)
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn find_identity_by_app_store_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .inner
            .read()
            .identities
            .values()
            .filter(|s| s.identity.app_store_transaction_id.as_deref() == Some(transaction_id))
            .min_by_key(|s| (s.identity.merged_into.is_some(), s.identity.id.clone()))
            .map(StoredIdentity::load))
    }

    async fn list_identities(&self, query: IdentityQuery) -> Result<Vec<Identity>, StoreError> {
        let mut identities: Vec<Identity> = self
            .inner
            .read()
            .identities
            .values()
            .filter(|s| query.include_disabled || !s.identity.disabled)
            .map(StoredIdentity::load)
            .filter(|i| query.tier.is_none_or(|t| i.entitlement.tier == t))
            .collect();
        identities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            identities.truncate(limit);
        }
        Ok(identities)
    }

    async fn duplicate_emails(&self) -> Result<Vec<String>, StoreError> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for stored in self.inner.read().identities.values() {
            if !stored.identity.disabled && stored.identity.merged_into.is_none() {
                *counts.entry(stored.identity.normalized_email()).or_default() += 1;
            }
        }
        let mut emails: Vec<String> = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(email, _)| email)
            .collect();
        emails.sort();
        Ok(emails)
    }

    async fn insert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.identities.contains_key(&identity.id) {
            return Err(StoreError::Database(format!(
                "Identity {} already exists",
                identity.id
            )));
        }
        let mut identity = identity.clone();
        identity.needs_flatten = false;
        inner.identities.insert(
            identity.id.clone(),
            StoredIdentity {
                document: write_document(&identity.entitlement),
                schema_version: CURRENT_SCHEMA_VERSION,
                identity,
            },
        );
        Ok(())
    }

    async fn save_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let stored = inner
            .identities
            .get_mut(&identity.id)
            .ok_or_else(|| StoreError::NotFound(format!("identity {}", identity.id)))?;
        let mut identity = identity.clone();
        identity.needs_flatten = false;
        stored.document = write_document(&identity.entitlement);
        stored.schema_version = CURRENT_SCHEMA_VERSION;
        stored.identity = identity;
        Ok(())
    }

    async fn record_sync(&self, identity_id: &str, update: SyncUpdate) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let stored = inner
            .identities
            .get_mut(identity_id)
            .ok_or_else(|| StoreError::NotFound(format!("identity {}", identity_id)))?;
        let sync = &mut stored.identity.sync;
        match update {
            SyncUpdate::Ok { at } => {
                sync.state = SyncState::Ok;
                sync.last_synced_at = Some(at);
                sync.last_error = None;
            }
            SyncUpdate::Failed { error, .. } => {
                sync.state = SyncState::Error;
                sync.last_error = Some(error);
            }
        }
        Ok(())
    }

    async fn subscriptions_for_identities(
        &self,
        identity_ids: &[String],
    ) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .inner
            .read()
            .subscriptions
            .values()
            .filter(|s| {
                s.identity_id
                    .as_ref()
                    .is_some_and(|id| identity_ids.contains(id))
            })
            .cloned()
            .collect())
    }

    async fn subscriptions_by_email(
        &self,
        email: &str,
        provider: Provider,
    ) -> Result<Vec<Subscription>, StoreError> {
        let email = normalize_email(email);
        Ok(self
            .inner
            .read()
            .subscriptions
            .values()
            .filter(|s| s.provider == provider && s.identity_id.is_none())
            .filter(|s| s.owner_email.as_deref().map(normalize_email) == Some(email.clone()))
            .cloned()
            .collect())
    }

    async fn get_subscription(
        &self,
        provider: Provider,
        provider_subscription_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .inner
            .read()
            .subscriptions
            .get(&(provider, provider_subscription_id.to_string()))
            .cloned())
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        self.inner.write().subscriptions.insert(
            (
                subscription.provider,
                subscription.provider_subscription_id.clone(),
            ),
            subscription.clone(),
        );
        Ok(())
    }

    async fn list_owned(
        &self,
        kind: OwnedKind,
        identity: &Identity,
    ) -> Result<Vec<OwnedRecordRef>, StoreError> {
        let inner = self.inner.read();
        let mut refs = Vec::new();

        let target = |key: OwnerKey| match key {
            OwnerKey::Id => identity.id.as_str(),
            OwnerKey::Email => identity.email.as_str(),
        };

        if kind == OwnedKind::Subscription {
            for sub in inner.subscriptions.values() {
                let record_id = subscription_record_id(sub.provider, &sub.provider_subscription_id);
                for field in kind.owner_fields() {
                    let value = match field.key {
                        OwnerKey::Id => sub.identity_id.as_deref(),
                        OwnerKey::Email => sub.owner_email.as_deref(),
                    };
                    if value == Some(target(field.key)) {
                        refs.push(OwnedRecordRef {
                            kind,
                            record_id: record_id.clone(),
                            column: field.column,
                            value: target(field.key).to_string(),
                        });
                    }
                }
            }
            return Ok(refs);
        }

        for ((row_kind, record_id), row) in inner.owned.iter() {
            if *row_kind != kind {
                continue;
            }
            for field in kind.owner_fields() {
                if row.owners.get(field.column).map(|v| v.as_str()) == Some(target(field.key)) {
                    refs.push(OwnedRecordRef {
                        kind,
                        record_id: record_id.clone(),
                        column: field.column,
                        value: target(field.key).to_string(),
                    });
                }
            }
        }
        Ok(refs)
    }

    async fn reassign_owned(&self, moves: &[OwnedRecordMove]) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let mut moved = 0;

        for mv in moves {
            if mv.kind == OwnedKind::Subscription {
                let Some(sub) = inner.subscriptions.values_mut().find(|s| {
                    subscription_record_id(s.provider, &s.provider_subscription_id) == mv.record_id
                }) else {
                    continue;
                };
                let slot = match mv.column.as_str() {
                    "identityId" => &mut sub.identity_id,
                    "ownerEmail" => &mut sub.owner_email,
                    other => {
                        return Err(StoreError::Malformed(format!(
                            "unknown subscription owner column {}",
                            other
                        )));
                    }
                };
                if slot.as_deref() == Some(mv.from.as_str()) {
                    *slot = Some(mv.to.clone());
                    moved += 1;
                }
                continue;
            }

            if let Some(row) = inner.owned.get_mut(&(mv.kind, mv.record_id.clone()))
                && let Some(value) = row.owners.get_mut(mv.column.as_str())
                && *value == mv.from
            {
                *value = mv.to.clone();
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn replace_unresolved_drift(
        &self,
        scope: &[String],
        records: &[DriftRecord],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .drift
            .retain(|_, r| r.resolved || !scope.contains(&r.identity_id));
        for record in records {
            inner.drift.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn list_drift(&self, only_unresolved: bool) -> Result<Vec<DriftRecord>, StoreError> {
        let mut records: Vec<DriftRecord> = self
            .inner
            .read()
            .drift
            .values()
            .filter(|r| !only_unresolved || !r.resolved)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.identity_id
                .cmp(&b.identity_id)
                .then_with(|| a.detected_at.cmp(&b.detected_at))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Tier, EntitlementStatus};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn identity(id: &str, email: &str) -> Identity {
        Identity::new(id, email, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_raw_nested_document_is_normalized_on_read() {
        let store = MemoryStore::new();
        store.insert_raw_identity(
            identity("a", "a@example.com"),
            json!({"tier": "pro", "entitlement": {"status": "active"}}),
            1,
        );

        let loaded = store.get_identity("a").await.unwrap().unwrap();
        assert!(loaded.needs_flatten);
        assert_eq!(loaded.entitlement.tier, Tier::Pro);
        assert_eq!(loaded.entitlement.status, EntitlementStatus::Active);

        store.save_identity(&loaded).await.unwrap();
        let (doc, version) = store.raw_document("a").unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        assert!(doc.get("entitlement").is_none());
        assert!(!store.get_identity("a").await.unwrap().unwrap().needs_flatten);
    }

    #[tokio::test]
    async fn test_email_lookup_is_case_insensitive() {
        let store = MemoryStore::new();
        store.insert_identity(&identity("a", "X@Y.com")).await.unwrap();
        store.insert_identity(&identity("b", "x@y.com ")).await.unwrap();

        let found = store.find_identities_by_email("x@y.COM").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(store.duplicate_emails().await.unwrap(), vec!["x@y.com".to_string()]);
    }

    #[tokio::test]
    async fn test_reassign_only_moves_matching_owner() {
        let store = MemoryStore::new();
        store.add_owned(OwnedKind::FollowEdge, "f1", &[("followerId", "a"), ("followingId", "c")]);

        let moves = vec![
            OwnedRecordMove {
                kind: OwnedKind::FollowEdge,
                record_id: "f1".into(),
                column: "followerId".into(),
                from: "a".into(),
                to: "b".into(),
            },
            OwnedRecordMove {
                kind: OwnedKind::FollowEdge,
                record_id: "f1".into(),
                column: "followingId".into(),
                from: "a".into(),
                to: "b".into(),
            },
        ];
        assert_eq!(store.reassign_owned(&moves).await.unwrap(), 1);
        assert_eq!(store.owned_by(OwnedKind::FollowEdge, "followerId", "b"), vec!["f1".to_string()]);
        assert_eq!(store.owned_by(OwnedKind::FollowEdge, "followingId", "c"), vec!["f1".to_string()]);
    }

    #[tokio::test]
    async fn test_app_store_holder_includes_merged_identities() {
        let store = MemoryStore::new();
        let mut merged = identity("b", "b@example.com");
        merged.app_store_transaction_id = Some("tx-1".into());
        merged.merged_into = Some("a".into());
        store.insert_identity(&merged).await.unwrap();

        let holder = store.find_identity_by_app_store_id("tx-1").await.unwrap().unwrap();
        assert_eq!(holder.id, "b");

        // An unmerged holder of the same id is preferred
        let mut live = identity("c", "c@example.com");
        live.app_store_transaction_id = Some("tx-1".into());
        store.insert_identity(&live).await.unwrap();
        let holder = store.find_identity_by_app_store_id("tx-1").await.unwrap().unwrap();
        assert_eq!(holder.id, "c");
    }
}
