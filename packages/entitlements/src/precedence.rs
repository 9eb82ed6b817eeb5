//! Precedence resolution: one authoritative tier/status/provider per identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::aggregate::is_active_for_entitlement;
use crate::config::ProviderFallback;
use crate::error::ReconcileError;
use crate::model::{
    EntitlementStatus, Identity, Level, Provider, Subscription, SubscriptionStatus, Tier,
};
use crate::provider::ProviderLookup;

/// Where the resolved state came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Stored subscriptions only
    Aggregated,
    /// Stored subscriptions plus a successful live provider answer
    Live,
    /// Live lookup failed; concluded from stored subscriptions
    Fallback,
    /// Live lookup failed; stored entitlement kept as-is
    KeepCurrent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecidedBy {
    pub provider: Provider,
    pub provider_subscription_id: String,
}

impl From<&Subscription> for DecidedBy {
    fn from(sub: &Subscription) -> Self {
        Self {
            provider: sub.provider,
            provider_subscription_id: sub.provider_subscription_id.clone(),
        }
    }
}

/// Result of a live provider lookup, kept for the caller to persist
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LiveOutcome {
    Found(Vec<Subscription>),
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub tier: Tier,
    pub level: Level,
    pub status: EntitlementStatus,
    /// Provider of the deciding active subscription
    pub provider: Option<Provider>,
    pub stripe_customer_id: Option<String>,
    pub app_store_transaction_id: Option<String>,
    /// Tier, level or status differ from the stored entitlement
    pub changed: bool,
    pub decided_by: Option<DecidedBy>,
    pub source: ResolutionSource,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub live: Option<LiveOutcome>,
}

/// Live provider hook consulted when nothing stored is active
#[derive(Clone, Copy)]
pub struct LiveLookup<'a> {
    pub provider: &'a dyn ProviderLookup,
    pub timeout: Duration,
    pub fallback: ProviderFallback,
}

fn status_rank(status: SubscriptionStatus) -> u8 {
    match status {
        SubscriptionStatus::Active => 2,
        SubscriptionStatus::Trialing => 1,
        _ => 0,
    }
}

/// Best first: higher tier, active over trialing, later period start, then
/// provider subscription id so equal candidates always order the same way
pub fn precedence_cmp(a: &Subscription, b: &Subscription) -> Ordering {
    b.tier
        .rank()
        .cmp(&a.tier.rank())
        .then_with(|| status_rank(b.status).cmp(&status_rank(a.status)))
        .then_with(|| b.period_start.cmp(&a.period_start))
        .then_with(|| a.provider_subscription_id.cmp(&b.provider_subscription_id))
}

fn recency_cmp(a: &Subscription, b: &Subscription) -> Ordering {
    b.period_start
        .cmp(&a.period_start)
        .then_with(|| b.period_end.cmp(&a.period_end))
        .then_with(|| a.provider_subscription_id.cmp(&b.provider_subscription_id))
}

/// Status carried by a subscription that no longer grants access
fn lapsed_status(sub: &Subscription) -> EntitlementStatus {
    match sub.status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => EntitlementStatus::Expired,
        SubscriptionStatus::Incomplete => EntitlementStatus::Inactive,
        other => other.to_entitlement(),
    }
}

fn billing_ids(subs: &[Subscription], now: DateTime<Utc>) -> (Option<String>, Option<String>) {
    let mut ordered: Vec<&Subscription> = subs.iter().collect();
    ordered.sort_by(|a, b| {
        is_active_for_entitlement(b, now)
            .cmp(&is_active_for_entitlement(a, now))
            .then_with(|| recency_cmp(a, b))
    });

    let stripe = ordered
        .iter()
        .filter(|s| s.provider == Provider::Stripe)
        .find_map(|s| s.customer_id.clone());
    let app_store = ordered
        .iter()
        .find(|s| s.provider == Provider::AppStore)
        .map(|s| s.provider_subscription_id.clone());
    (stripe, app_store)
}

/// Pure resolution over a fixed set of subscriptions
pub fn resolve_from(identity: &Identity, subs: &[Subscription], now: DateTime<Utc>) -> Resolution {
    let (stripe_customer_id, app_store_transaction_id) = billing_ids(subs, now);

    let mut active: Vec<&Subscription> = subs
        .iter()
        .filter(|s| is_active_for_entitlement(s, now))
        .collect();
    active.sort_by(|a, b| precedence_cmp(a, b));

    let (tier, status, provider, decided_by) = match active.first() {
        Some(best) => (
            best.tier,
            best.status.to_entitlement(),
            Some(best.provider),
            Some(DecidedBy::from(*best)),
        ),
        None => match subs.iter().min_by(|a, b| recency_cmp(a, b)) {
            Some(latest) => (
                Tier::Free,
                lapsed_status(latest),
                None,
                Some(DecidedBy::from(latest)),
            ),
            None => (Tier::Free, EntitlementStatus::Inactive, None, None),
        },
    };

    let level = Level::from_tier(tier);
    let current = &identity.entitlement;
    let changed = current.tier != tier || current.level != level || current.status != status;

    Resolution {
        tier,
        level,
        status,
        provider,
        stripe_customer_id,
        app_store_transaction_id,
        changed,
        decided_by,
        source: ResolutionSource::Aggregated,
        warnings: Vec::new(),
        live: None,
    }
}

fn keep_current(identity: &Identity, mut resolution: Resolution) -> Resolution {
    resolution.tier = identity.entitlement.tier;
    resolution.level = identity.entitlement.level;
    resolution.status = identity.entitlement.status;
    resolution.provider = identity.entitlement.subscription_provider;
    resolution.decided_by = None;
    resolution.changed = false;
    resolution.source = ResolutionSource::KeepCurrent;
    resolution
}

/// Resolve the entitlement for `identity`.
///
/// The live lookup only runs when no stored subscription is active. A
/// successful answer, including "nothing active", is authoritative; a failure
/// or timeout falls back per `LiveLookup::fallback`.
pub async fn resolve(
    identity: &Identity,
    subs: &[Subscription],
    now: DateTime<Utc>,
    live: Option<LiveLookup<'_>>,
) -> Resolution {
    let stored = resolve_from(identity, subs, now);

    let Some(live) = live else {
        return stored;
    };
    if stored.provider.is_some() {
        return stored;
    }

    let answer = match tokio::time::timeout(live.timeout, live.provider.lookup(identity)).await {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::provider_unavailable(format!(
            "{} lookup timed out after {}s",
            live.provider.name(),
            live.timeout.as_secs()
        ))),
    };

    match answer {
        Ok(found) => {
            let mut merged: BTreeMap<(Provider, String), Subscription> = subs
                .iter()
                .map(|s| ((s.provider, s.provider_subscription_id.clone()), s.clone()))
                .collect();
            for sub in &found {
                let mut sub = sub.clone();
                if sub.identity_id.is_none() {
                    sub.identity_id = Some(identity.id.clone());
                }
                merged.insert((sub.provider, sub.provider_subscription_id.clone()), sub);
            }
            let merged: Vec<Subscription> = merged.into_values().collect();

            let mut resolution = resolve_from(identity, &merged, now);
            resolution.source = ResolutionSource::Live;
            resolution.live = Some(LiveOutcome::Found(found));
            resolution
        }
        Err(err) => {
            tracing::warn!(
                identity_id = %identity.id,
                provider = live.provider.name(),
                error = %err,
                "Live provider lookup failed"
            );
            let mut resolution = match live.fallback {
                ProviderFallback::Aggregated => {
                    let mut r = stored;
                    r.source = ResolutionSource::Fallback;
                    r
                }
                ProviderFallback::KeepCurrent => keep_current(identity, stored),
            };
            resolution.warnings.push(err.to_string());
            resolution.live = Some(LiveOutcome::Failed(err.message().to_string()));
            resolution
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::model::Entitlement;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn sub(psid: &str, tier: Tier, status: SubscriptionStatus, start: DateTime<Utc>) -> Subscription {
        Subscription {
            identity_id: Some("a".into()),
            owner_email: None,
            provider: Provider::Stripe,
            provider_subscription_id: psid.into(),
            customer_id: Some("cus_1".into()),
            status,
            tier,
            interval: None,
            period_start: Some(start),
            period_end: Some(now() + ChronoDuration::days(20)),
            cancel_at_period_end: false,
            first_started_at: None,
        }
    }

    #[derive(Debug)]
    struct StaticLookup(std::result::Result<Vec<Subscription>, ReconcileError>);

    #[async_trait]
    impl ProviderLookup for StaticLookup {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn lookup(&self, _identity: &Identity) -> Result<Vec<Subscription>> {
            self.0.clone()
        }
    }

    #[derive(Debug)]
    struct SlowLookup;

    #[async_trait]
    impl ProviderLookup for SlowLookup {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn lookup(&self, _identity: &Identity) -> Result<Vec<Subscription>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_pro_trialing_beats_premium_active() {
        let identity = Identity::new("a", "a@example.com", now());
        let premium = sub("p1", Tier::Premium, SubscriptionStatus::Active, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let pro = sub("p2", Tier::Pro, SubscriptionStatus::Trialing, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());

        for subs in [vec![premium.clone(), pro.clone()], vec![pro.clone(), premium.clone()]] {
            let r = resolve_from(&identity, &subs, now());
            assert_eq!(r.tier, Tier::Pro);
            assert_eq!(r.level, Level::Paid);
            assert_eq!(r.status, EntitlementStatus::Trialing);
            assert_eq!(r.decided_by.unwrap().provider_subscription_id, "p2");
            assert!(r.changed);
        }
    }

    #[test]
    fn test_lapsed_subscription_reports_expired() {
        let identity = Identity::new("a", "a@example.com", now());
        let mut old = sub("p1", Tier::Pro, SubscriptionStatus::Active, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        old.period_end = Some(now() - ChronoDuration::days(1));

        let r = resolve_from(&identity, &[old], now());
        assert_eq!(r.tier, Tier::Free);
        assert_eq!(r.status, EntitlementStatus::Expired);
        assert_eq!(r.provider, None);
    }

    #[test]
    fn test_no_subscriptions_is_inactive_and_unchanged_for_default() {
        let identity = Identity::new("a", "a@example.com", now());
        let r = resolve_from(&identity, &[], now());
        assert_eq!(r.status, EntitlementStatus::Inactive);
        assert!(!r.changed);
        assert!(r.decided_by.is_none());
    }

    #[tokio::test]
    async fn test_live_none_is_authoritative() {
        let mut identity = Identity::new("a", "a@example.com", now());
        identity.entitlement = Entitlement {
            tier: Tier::Pro,
            level: Level::Paid,
            status: EntitlementStatus::Active,
            subscription_provider: Some(Provider::Stripe),
        };
        let lookup = StaticLookup(Ok(Vec::new()));
        let live = LiveLookup {
            provider: &lookup,
            timeout: Duration::from_secs(1),
            fallback: ProviderFallback::KeepCurrent,
        };

        let r = resolve(&identity, &[], now(), Some(live)).await;
        assert_eq!(r.source, ResolutionSource::Live);
        assert_eq!(r.tier, Tier::Free);
        assert!(r.changed);
    }

    #[tokio::test]
    async fn test_live_found_upgrades() {
        let identity = Identity::new("a", "a@example.com", now());
        let mut found = sub("live", Tier::Premium, SubscriptionStatus::Active, now());
        found.identity_id = None;
        let lookup = StaticLookup(Ok(vec![found]));
        let live = LiveLookup {
            provider: &lookup,
            timeout: Duration::from_secs(1),
            fallback: ProviderFallback::Aggregated,
        };

        let r = resolve(&identity, &[], now(), Some(live)).await;
        assert_eq!(r.tier, Tier::Premium);
        assert_eq!(r.stripe_customer_id.as_deref(), Some("cus_1"));
        assert!(matches!(r.live, Some(LiveOutcome::Found(ref s)) if s.len() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_current_when_configured() {
        let mut identity = Identity::new("a", "a@example.com", now());
        identity.entitlement.tier = Tier::Premium;
        identity.entitlement.level = Level::Paid;
        identity.entitlement.status = EntitlementStatus::Active;

        let live = LiveLookup {
            provider: &SlowLookup,
            timeout: Duration::from_secs(10),
            fallback: ProviderFallback::KeepCurrent,
        };
        let r = resolve(&identity, &[], now(), Some(live)).await;
        assert_eq!(r.source, ResolutionSource::KeepCurrent);
        assert_eq!(r.tier, Tier::Premium);
        assert!(!r.changed);
        assert_eq!(r.warnings.len(), 1);

        let live = LiveLookup {
            fallback: ProviderFallback::Aggregated,
            ..live
        };
        let r = resolve(&identity, &[], now(), Some(live)).await;
        assert_eq!(r.source, ResolutionSource::Fallback);
        assert_eq!(r.tier, Tier::Free);
        assert!(r.changed);
    }
}
