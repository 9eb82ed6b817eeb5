//! Normalizing provider subscription events into stored subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::model::{BillingInterval, Provider, Subscription, SubscriptionStatus, Tier};

/// A subscription fact reported by a sync job, webhook handler or client
/// purchase, after transport and signature checks. Strings are raw provider
/// values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub provider: String,
    pub provider_subscription_id: String,
    pub identity_id: Option<String>,
    pub email: Option<String>,
    pub customer_id: Option<String>,
    pub status: String,
    pub tier: String,
    pub interval: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub started_at: Option<DateTime<Utc>>,
}

impl SubscriptionEvent {
    /// Normalized subscription, not yet linked to an owner
    pub fn normalize(&self) -> Result<Subscription> {
        let provider = Provider::normalize(&self.provider).ok_or_else(|| {
            ReconcileError::malformed(format!("Unknown subscription provider {:?}", self.provider))
        })?;
        let provider_subscription_id = self.provider_subscription_id.trim();
        if provider_subscription_id.is_empty() {
            return Err(ReconcileError::malformed("Missing provider subscription id"));
        }

        Ok(Subscription {
            identity_id: None,
            owner_email: self.email.as_ref().map(|e| e.trim().to_string()),
            provider,
            provider_subscription_id: provider_subscription_id.to_string(),
            customer_id: self.customer_id.clone(),
            status: SubscriptionStatus::normalize(&self.status),
            tier: Tier::normalize(&self.tier),
            interval: self.interval.as_deref().and_then(BillingInterval::normalize),
            period_start: self.period_start,
            period_end: self.period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            first_started_at: self.started_at.or(self.period_start),
        })
    }
}

/// Fold an incoming subscription into the stored row.
///
/// `first_started_at` never changes once set. A known period end only moves
/// earlier when the incoming status is canceled or expired; otherwise the
/// stored end is kept and a warning returned. Missing ownership on the
/// incoming side keeps the stored owner.
pub fn merge_incoming(
    existing: Option<&Subscription>,
    mut incoming: Subscription,
) -> (Subscription, Vec<String>) {
    let mut warnings = Vec::new();
    let Some(existing) = existing else {
        return (incoming, warnings);
    };

    if existing.first_started_at.is_some() {
        incoming.first_started_at = existing.first_started_at;
    }

    if let (Some(stored_end), Some(new_end)) = (existing.period_end, incoming.period_end)
        && new_end < stored_end
        && !incoming.status.is_terminal()
    {
        let warning = format!(
            "Ignoring earlier period end {} for {} subscription {} (stored {})",
            new_end.to_rfc3339(),
            incoming.provider,
            incoming.provider_subscription_id,
            stored_end.to_rfc3339()
        );
        tracing::warn!("{}", warning);
        warnings.push(warning);
        incoming.period_end = Some(stored_end);
    }
    if incoming.period_end.is_none() {
        incoming.period_end = existing.period_end;
    }

    if incoming.identity_id.is_none() {
        incoming.identity_id = existing.identity_id.clone();
    }
    if incoming.owner_email.is_none() {
        incoming.owner_email = existing.owner_email.clone();
    }
    if incoming.customer_id.is_none() {
        incoming.customer_id = existing.customer_id.clone();
    }
    if incoming.interval.is_none() {
        incoming.interval = existing.interval;
    }

    (incoming, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn event(status: &str, period_end: DateTime<Utc>) -> SubscriptionEvent {
        SubscriptionEvent {
            provider: "Stripe".into(),
            provider_subscription_id: " sub_1 ".into(),
            email: Some("A@Example.com".into()),
            status: status.into(),
            tier: "Pro ".into(),
            interval: Some("monthly".into()),
            period_start: Some(start()),
            period_end: Some(period_end),
            ..Default::default()
        }
    }

    #[test]
    fn test_event_normalization() {
        let sub = event("Active", start() + Duration::days(30)).normalize().unwrap();
        assert_eq!(sub.provider, Provider::Stripe);
        assert_eq!(sub.provider_subscription_id, "sub_1");
        assert_eq!(sub.tier, Tier::Pro);
        assert_eq!(sub.interval, Some(BillingInterval::Month));
        assert_eq!(sub.first_started_at, Some(start()));
    }

    #[test]
    fn test_unknown_provider_is_malformed() {
        let mut bad = event("active", start());
        bad.provider = "paypal".into();
        assert!(bad.normalize().is_err());
    }

    #[test]
    fn test_period_end_never_moves_earlier_unless_terminal() {
        let stored = event("active", start() + Duration::days(60)).normalize().unwrap();

        let earlier = event("active", start() + Duration::days(30)).normalize().unwrap();
        let (merged, warnings) = merge_incoming(Some(&stored), earlier);
        assert_eq!(merged.period_end, stored.period_end);
        assert_eq!(warnings.len(), 1);

        let canceled = event("canceled", start() + Duration::days(30)).normalize().unwrap();
        let (merged, warnings) = merge_incoming(Some(&stored), canceled);
        assert_eq!(merged.period_end, Some(start() + Duration::days(30)));
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_first_started_at_is_immutable() {
        let stored = event("active", start() + Duration::days(30)).normalize().unwrap();
        let mut renewal = event("active", start() + Duration::days(60)).normalize().unwrap();
        renewal.first_started_at = Some(start() + Duration::days(30));
        let (merged, _) = merge_incoming(Some(&stored), renewal);
        assert_eq!(merged.first_started_at, Some(start()));
    }
}
