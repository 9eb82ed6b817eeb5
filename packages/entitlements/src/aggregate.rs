//! Subscription aggregation across providers.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::{Identity, Provider, Subscription, SubscriptionStatus};
use crate::store::EntitlementStore;

/// The one predicate deciding whether a subscription grants access right now.
///
/// A known period end at or before `now` always wins over the status.
/// `incomplete` only counts while its period end is known and in the future.
pub fn is_active_for_entitlement(sub: &Subscription, now: DateTime<Utc>) -> bool {
    if sub.period_end.is_some_and(|end| end <= now) {
        return false;
    }
    match sub.status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => true,
        SubscriptionStatus::Incomplete => sub.period_end.is_some(),
        _ => false,
    }
}

/// Every subscription known for `identity`.
///
/// `aliases` are ids of duplicates that are about to be merged into this
/// identity; their rows are included so a dry run sees the merged view. When
/// nothing is linked by id, unlinked rows of the legacy provider are joined by
/// owner email.
#[tracing::instrument(name = "list_subscriptions", skip(store, identity, aliases), fields(identity_id = %identity.id))]
pub async fn list_subscriptions(
    store: &dyn EntitlementStore,
    identity: &Identity,
    aliases: &[String],
    legacy_provider: Provider,
) -> Result<Vec<Subscription>> {
    let mut ids = Vec::with_capacity(aliases.len() + 1);
    ids.push(identity.id.clone());
    ids.extend(aliases.iter().filter(|a| **a != identity.id).cloned());

    let mut subs = store.subscriptions_for_identities(&ids).await?;

    if subs.is_empty() {
        subs = store
            .subscriptions_by_email(&identity.email, legacy_provider)
            .await?;
        if !subs.is_empty() {
            tracing::debug!(count = subs.len(), "Joined legacy subscriptions by owner email");
        }
    }

    // (provider, provider subscription id) is unique; keep a stable order
    let unique: BTreeMap<(Provider, String), Subscription> = subs
        .into_iter()
        .map(|s| ((s.provider, s.provider_subscription_id.clone()), s))
        .collect();

    Ok(unique.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tier;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn sub(psid: &str, status: SubscriptionStatus, period_end: Option<DateTime<Utc>>) -> Subscription {
        Subscription {
            identity_id: Some("a".into()),
            owner_email: Some("a@example.com".into()),
            provider: Provider::Stripe,
            provider_subscription_id: psid.into(),
            customer_id: None,
            status,
            tier: Tier::Premium,
            interval: None,
            period_start: None,
            period_end,
            cancel_at_period_end: false,
            first_started_at: None,
        }
    }

    #[test]
    fn test_incomplete_boundary() {
        let past = sub("s", SubscriptionStatus::Incomplete, Some(now() - Duration::seconds(1)));
        let ahead = sub("s", SubscriptionStatus::Incomplete, Some(now() + Duration::seconds(1)));
        let unknown = sub("s", SubscriptionStatus::Incomplete, None);
        assert!(!is_active_for_entitlement(&past, now()));
        assert!(is_active_for_entitlement(&ahead, now()));
        assert!(!is_active_for_entitlement(&unknown, now()));
    }

    #[test]
    fn test_period_end_overrides_status() {
        let ended = sub("s", SubscriptionStatus::Active, Some(now()));
        assert!(!is_active_for_entitlement(&ended, now()));
        let open = sub("s", SubscriptionStatus::Trialing, None);
        assert!(is_active_for_entitlement(&open, now()));
        let past_due = sub("s", SubscriptionStatus::PastDue, Some(now() + Duration::days(3)));
        assert!(!is_active_for_entitlement(&past_due, now()));
    }

    #[tokio::test]
    async fn test_email_fallback_only_when_nothing_linked() {
        let store = MemoryStore::new();
        let identity = Identity::new("a", "A@Example.com", now());

        let mut legacy = sub("legacy", SubscriptionStatus::Active, None);
        legacy.identity_id = None;
        legacy.owner_email = Some("a@example.com".into());
        store.upsert_subscription(&legacy).await.unwrap();

        let mut app_store = legacy.clone();
        app_store.provider = Provider::AppStore;
        app_store.provider_subscription_id = "ios".into();
        store.upsert_subscription(&app_store).await.unwrap();

        let found = list_subscriptions(&store, &identity, &[], Provider::Stripe)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].provider_subscription_id, "legacy");

        store
            .upsert_subscription(&sub("linked", SubscriptionStatus::Active, None))
            .await
            .unwrap();
        let found = list_subscriptions(&store, &identity, &[], Provider::Stripe)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].provider_subscription_id, "linked");
    }

    #[tokio::test]
    async fn test_aliases_are_included() {
        let store = MemoryStore::new();
        let identity = Identity::new("a", "a@example.com", now());
        let mut other = sub("b-sub", SubscriptionStatus::Active, None);
        other.identity_id = Some("b".into());
        store.upsert_subscription(&other).await.unwrap();

        let found = list_subscriptions(&store, &identity, &["b".to_string()], Provider::Stripe)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
