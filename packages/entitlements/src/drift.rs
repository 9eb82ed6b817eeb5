//! Drift detection. Reporting only: findings are stored, never acted upon.

use chrono::{DateTime, Utc};

use crate::model::{DriftRecord, DriftType, Identity, Severity, SyncState, Subscription, Tier};
use crate::precedence::resolve_from;

fn record(
    identity: &Identity,
    drift_type: DriftType,
    severity: Severity,
    detail: String,
    now: DateTime<Utc>,
) -> DriftRecord {
    DriftRecord {
        id: uuid::Uuid::new_v4().to_string(),
        identity_id: identity.id.clone(),
        drift_type,
        severity,
        detail,
        detected_at: now,
        resolved: false,
    }
}

/// All findings for one identity, given its aggregated subscriptions
pub fn detect(
    identity: &Identity,
    subs: &[Subscription],
    stale_after: chrono::Duration,
    now: DateTime<Utc>,
) -> Vec<DriftRecord> {
    let mut found = Vec::new();

    if identity.billing_provider.is_some() {
        let stale = match identity.sync.last_synced_at {
            None => Some("never synced".to_string()),
            Some(at) if now - at > stale_after => Some(format!("last synced {}", at.to_rfc3339())),
            Some(_) => None,
        };
        if let Some(detail) = stale {
            found.push(record(identity, DriftType::StaleSync, Severity::Low, detail, now));
        }
    }

    if identity.sync.state == SyncState::Error {
        let detail = identity
            .sync
            .last_error
            .clone()
            .unwrap_or_else(|| "sync failed".to_string());
        found.push(record(identity, DriftType::SyncError, Severity::High, detail, now));
    }

    if identity.stripe_customer_id.is_some() && identity.entitlement.tier == Tier::Free {
        found.push(record(
            identity,
            DriftType::PaidButFree,
            Severity::High,
            "Stripe customer on free tier".to_string(),
            now,
        ));
    }

    if let (Some(billing), Some(subscription)) = (
        identity.billing_provider,
        identity.entitlement.subscription_provider,
    ) && billing != subscription
    {
        found.push(record(
            identity,
            DriftType::ProviderMismatch,
            Severity::Medium,
            format!("billing {} but subscription {}", billing, subscription),
            now,
        ));
    }

    let resolution = resolve_from(identity, subs, now);
    if resolution.changed {
        found.push(record(
            identity,
            DriftType::EntitlementMismatch,
            Severity::Medium,
            format!(
                "stored {}/{} but subscriptions say {}/{}",
                identity.entitlement.tier,
                identity.entitlement.status.as_str(),
                resolution.tier,
                resolution.status.as_str()
            ),
            now,
        ));
    }

    found
}
