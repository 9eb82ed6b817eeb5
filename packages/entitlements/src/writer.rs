//! Entitlement writer: the only code path that mutates entitlement fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::guard::{AppStoreDecision, SkippedIdentifier, guard_app_store_attach};
use crate::model::{Entitlement, EntitlementSnapshot, Identity, Provider};
use crate::precedence::Resolution;
use crate::store::EntitlementStore;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// The stored identity differs from what it should be
    pub applied: bool,
    /// Subscription provider, billing provider or a billing id differs from
    /// the stored identity
    pub identifiers_changed: bool,
    /// The write reached the store; false for dry runs
    #[serde(skip)]
    pub persisted: bool,
    pub after: EntitlementSnapshot,
    pub skipped_identifiers: Vec<SkippedIdentifier>,
    /// Identity as it is (or would be) stored after the write
    #[serde(skip)]
    pub identity: Option<Identity>,
}

/// Apply `resolution` to `identity`.
///
/// Tier, level and status are written when the resolution reports a change.
/// A Stripe customer id is only attached when none is held; an App Store id
/// only through the conflict guard. Rows read in a legacy shape are rewritten
/// flat even when nothing else changed. `aliases` are duplicates being merged
/// into `identity` in the same run.
#[tracing::instrument(name = "apply_entitlement", skip_all, fields(identity_id = %identity.id, dry_run = dry_run))]
pub async fn apply(
    store: &dyn EntitlementStore,
    identity: &Identity,
    resolution: &Resolution,
    aliases: &[String],
    dry_run: bool,
    now: DateTime<Utc>,
) -> Result<WriteOutcome> {
    let mut next = identity.clone();
    let mut applied = false;
    let mut skipped_identifiers = Vec::new();

    if resolution.changed {
        next.entitlement = Entitlement {
            tier: resolution.tier,
            level: resolution.level,
            status: resolution.status,
            subscription_provider: resolution.provider,
        };
        applied = true;
    } else if next.entitlement.subscription_provider != resolution.provider {
        next.entitlement.subscription_provider = resolution.provider;
        applied = true;
    }

    if next.stripe_customer_id.is_none()
        && let Some(customer_id) = &resolution.stripe_customer_id
    {
        next.stripe_customer_id = Some(customer_id.clone());
        next.billing_provider = Some(Provider::Stripe);
        applied = true;
    }

    if let Some(transaction_id) = &resolution.app_store_transaction_id {
        match guard_app_store_attach(store, &next, transaction_id, aliases).await? {
            AppStoreDecision::Attach => {
                next.app_store_transaction_id = Some(transaction_id.clone());
                if next.billing_provider.is_none() {
                    next.billing_provider = Some(Provider::AppStore);
                }
                applied = true;
            }
            AppStoreDecision::Unchanged => {}
            AppStoreDecision::Skip(reason) => {
                tracing::info!(reason = ?reason, "Not attaching App Store id");
                skipped_identifiers.push(SkippedIdentifier {
                    field: "app_store_transaction_id".into(),
                    value: transaction_id.clone(),
                    reason,
                });
            }
        }
    }

    let identifiers_changed = next.entitlement.subscription_provider
        != identity.entitlement.subscription_provider
        || next.billing_provider != identity.billing_provider
        || next.stripe_customer_id != identity.stripe_customer_id
        || next.app_store_transaction_id != identity.app_store_transaction_id;

    if next.needs_flatten {
        tracing::info!("Rewriting legacy entitlement document");
        applied = true;
    }

    let mut persisted = false;
    if applied {
        next.updated_at = now;
        if !dry_run {
            store.save_identity(&next).await?;
            next.needs_flatten = false;
            persisted = true;
            tracing::info!(
                tier = %next.entitlement.tier,
                status = next.entitlement.status.as_str(),
                "Entitlement written"
            );
        }
    }

    Ok(WriteOutcome {
        applied,
        identifiers_changed,
        persisted,
        after: EntitlementSnapshot::from(&next),
        skipped_identifiers,
        identity: Some(next),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::guard::SkipReason;
    use crate::model::{EntitlementStatus, Level, Tier};
    use crate::precedence::ResolutionSource;
    use crate::store::MemoryStore;

    fn resolution(changed: bool) -> Resolution {
        Resolution {
            tier: Tier::Premium,
            level: Level::Paid,
            status: EntitlementStatus::Active,
            provider: Some(Provider::AppStore),
            stripe_customer_id: None,
            app_store_transaction_id: Some("tx-1".into()),
            changed,
            decided_by: None,
            source: ResolutionSource::Aggregated,
            warnings: Vec::new(),
            live: None,
        }
    }

    #[tokio::test]
    async fn test_app_store_id_skipped_for_stripe_identity_but_tier_written() {
        let store = MemoryStore::new();
        let mut identity = Identity::new("a", "a@example.com", Utc::now());
        identity.stripe_customer_id = Some("cus_1".into());
        identity.billing_provider = Some(Provider::Stripe);
        store.insert_identity(&identity).await.unwrap();

        let outcome = apply(&store, &identity, &resolution(true), &[], false, Utc::now())
            .await
            .unwrap();
        assert!(outcome.applied && outcome.persisted);
        assert_eq!(outcome.skipped_identifiers[0].reason, SkipReason::StripeLinked);

        let stored = store.get_identity("a").await.unwrap().unwrap();
        assert_eq!(stored.entitlement.tier, Tier::Premium);
        assert_eq!(stored.app_store_transaction_id, None);
        assert_eq!(stored.billing_provider, Some(Provider::Stripe));
    }

    #[tokio::test]
    async fn test_conflicting_app_store_id_is_refused() {
        let store = MemoryStore::new();
        let mut other = Identity::new("b", "b@example.com", Utc::now());
        other.app_store_transaction_id = Some("tx-1".into());
        store.insert_identity(&other).await.unwrap();
        let identity = Identity::new("a", "a@example.com", Utc::now());
        store.insert_identity(&identity).await.unwrap();

        let err = apply(&store, &identity, &resolution(true), &[], false, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let stored = store.get_identity("a").await.unwrap().unwrap();
        assert_eq!(stored.entitlement.tier, Tier::Free);
    }

    #[tokio::test]
    async fn test_dry_run_persists_nothing() {
        let store = MemoryStore::new();
        let identity = Identity::new("a", "a@example.com", Utc::now());
        store.insert_identity(&identity).await.unwrap();
        let before = store.snapshot();

        let outcome = apply(&store, &identity, &resolution(true), &[], true, Utc::now())
            .await
            .unwrap();
        assert!(outcome.applied);
        assert!(!outcome.persisted);
        assert_eq!(outcome.after.app_store_transaction_id.as_deref(), Some("tx-1"));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_nothing_to_write_is_not_applied() {
        let store = MemoryStore::new();
        let mut identity = Identity::new("a", "a@example.com", Utc::now());
        identity.entitlement = Entitlement {
            tier: Tier::Premium,
            level: Level::Paid,
            status: EntitlementStatus::Active,
            subscription_provider: Some(Provider::AppStore),
        };
        identity.app_store_transaction_id = Some("tx-1".into());
        store.insert_identity(&identity).await.unwrap();

        let outcome = apply(&store, &identity, &resolution(false), &[], false, Utc::now())
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert!(!outcome.persisted);
    }

    #[tokio::test]
    async fn test_provider_correction_is_flagged_apart_from_tier_change() {
        let store = MemoryStore::new();
        let mut identity = Identity::new("a", "a@example.com", Utc::now());
        identity.entitlement = Entitlement {
            tier: Tier::Premium,
            level: Level::Paid,
            status: EntitlementStatus::Active,
            subscription_provider: Some(Provider::Stripe),
        };
        identity.app_store_transaction_id = Some("tx-1".into());
        store.insert_identity(&identity).await.unwrap();

        let outcome = apply(&store, &identity, &resolution(false), &[], false, Utc::now())
            .await
            .unwrap();
        assert!(outcome.applied);
        assert!(outcome.identifiers_changed);
        let stored = store.get_identity("a").await.unwrap().unwrap();
        assert_eq!(stored.entitlement.subscription_provider, Some(Provider::AppStore));
        assert_eq!(stored.entitlement.tier, Tier::Premium);

        let again = apply(&store, &stored, &resolution(false), &[], false, Utc::now())
            .await
            .unwrap();
        assert!(!again.applied);
        assert!(!again.identifiers_changed);
    }
}
