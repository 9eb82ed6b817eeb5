//! Stripe subscription lookup
//!
//! ## Configuration
//!
//! ```bash
//! STRIPE_SECRET_KEY=sk_live_...
//! STRIPE_TIER_PRODUCTS='{"prod_abc": "pro", "prod_def": "premium"}'
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use super::{ClientCache, ProviderLookup};
use crate::error::{ReconcileError, Result};
use crate::model::{BillingInterval, Identity, Provider, Subscription, SubscriptionStatus, Tier};

#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Stripe product id to tier
    pub tier_products: HashMap<String, Tier>,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"<redacted>")
            .field("tier_products", &self.tier_products)
            .finish()
    }
}

impl StripeConfig {
    /// `None` when no secret key is configured
    pub fn from_env() -> Option<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())?;

        let tier_products = match std::env::var("STRIPE_TIER_PRODUCTS") {
            Ok(raw) => parse_tier_products(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Invalid STRIPE_TIER_PRODUCTS, ignoring");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        Some(Self {
            secret_key,
            tier_products,
        })
    }
}

pub fn parse_tier_products(raw: &str) -> Result<HashMap<String, Tier>> {
    let map: HashMap<String, String> = serde_json::from_str(raw)?;
    Ok(map
        .into_iter()
        .map(|(product, tier)| (product, Tier::normalize(&tier)))
        .collect())
}

#[derive(Debug)]
pub struct StripeLookup {
    config: StripeConfig,
    clients: Arc<ClientCache<::stripe::Client>>,
}

impl StripeLookup {
    pub fn new(config: StripeConfig, clients: Arc<ClientCache<::stripe::Client>>) -> Self {
        Self { config, clients }
    }

    fn client(&self) -> Arc<::stripe::Client> {
        let secret = self.config.secret_key.clone();
        self.clients
            .get_or_create(&self.config.secret_key, move || ::stripe::Client::new(secret))
    }
}

fn timestamp(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}

pub(crate) fn map_status(status: &::stripe::SubscriptionStatus) -> SubscriptionStatus {
    match status {
        ::stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
        ::stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
        ::stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
        ::stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
        ::stripe::SubscriptionStatus::Canceled | ::stripe::SubscriptionStatus::Unpaid => {
            SubscriptionStatus::Canceled
        }
        ::stripe::SubscriptionStatus::IncompleteExpired | ::stripe::SubscriptionStatus::Paused => {
            SubscriptionStatus::Expired
        }
        #[allow(unreachable_patterns)]
        _ => SubscriptionStatus::Expired,
    }
}

/// Configured product ids win over `tier` price metadata; unmatched is free
pub(crate) fn tier_for(
    tier_products: &HashMap<String, Tier>,
    product_id: Option<&str>,
    price_tier: Option<&str>,
) -> Tier {
    if let Some(tier) = product_id.and_then(|id| tier_products.get(id)) {
        return *tier;
    }
    price_tier.map(Tier::normalize).unwrap_or(Tier::Free)
}

fn subscription_tier(tier_products: &HashMap<String, Tier>, sub: &::stripe::Subscription) -> Tier {
    sub.items
        .data
        .iter()
        .filter_map(|item| item.price.as_ref())
        .map(|price| {
            let product_id = price.product.as_ref().map(|product| match product {
                ::stripe::Expandable::Id(id) => id.to_string(),
                ::stripe::Expandable::Object(p) => p.id.to_string(),
            });
            let price_tier = price
                .metadata
                .as_ref()
                .and_then(|metadata| metadata.get("tier").cloned());
            tier_for(tier_products, product_id.as_deref(), price_tier.as_deref())
        })
        .max_by_key(|tier| tier.rank())
        .unwrap_or(Tier::Free)
}

fn subscription_interval(sub: &::stripe::Subscription) -> Option<BillingInterval> {
    sub.items
        .data
        .iter()
        .filter_map(|item| item.price.as_ref()?.recurring.as_ref())
        .find_map(|recurring| match recurring.interval {
            ::stripe::RecurringInterval::Month => Some(BillingInterval::Month),
            ::stripe::RecurringInterval::Year => Some(BillingInterval::Year),
            _ => None,
        })
}

#[async_trait]
impl ProviderLookup for StripeLookup {
    fn name(&self) -> &'static str {
        "stripe"
    }

    #[tracing::instrument(name = "stripe_lookup", skip(self, identity), fields(identity_id = %identity.id))]
    async fn lookup(&self, identity: &Identity) -> Result<Vec<Subscription>> {
        let Some(customer_id) = identity.stripe_customer_id.as_deref() else {
            return Ok(Vec::new());
        };
        let customer = ::stripe::CustomerId::from_str(customer_id).map_err(|e| {
            ReconcileError::malformed(format!("Invalid Stripe customer id {}: {}", customer_id, e))
        })?;

        let mut params = ::stripe::ListSubscriptions::new();
        params.customer = Some(customer);
        params.status = Some(::stripe::SubscriptionStatusFilter::All);
        params.limit = Some(100);

        let client = self.client();
        let list = ::stripe::Subscription::list(client.as_ref(), &params).await?;

        let subs: Vec<Subscription> = list
            .data
            .iter()
            .map(|sub| Subscription {
                identity_id: Some(identity.id.clone()),
                owner_email: Some(identity.email.clone()),
                provider: Provider::Stripe,
                provider_subscription_id: sub.id.to_string(),
                customer_id: Some(customer_id.to_string()),
                status: map_status(&sub.status),
                tier: subscription_tier(&self.config.tier_products, sub),
                interval: subscription_interval(sub),
                period_start: timestamp(sub.current_period_start),
                period_end: timestamp(sub.current_period_end),
                cancel_at_period_end: sub.cancel_at_period_end,
                first_started_at: timestamp(sub.start_date),
            })
            .collect();

        tracing::debug!(count = subs.len(), "Fetched Stripe subscriptions");
        Ok(subs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_products_win_over_metadata() {
        let products = parse_tier_products(r#"{"prod_pro": "Pro ", "prod_prem": "premium"}"#).unwrap();
        assert_eq!(tier_for(&products, Some("prod_pro"), Some("premium")), Tier::Pro);
        assert_eq!(tier_for(&products, Some("prod_other"), Some("PREMIUM")), Tier::Premium);
        assert_eq!(tier_for(&products, Some("prod_other"), None), Tier::Free);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status(&::stripe::SubscriptionStatus::Unpaid), SubscriptionStatus::Canceled);
        assert_eq!(
            map_status(&::stripe::SubscriptionStatus::IncompleteExpired),
            SubscriptionStatus::Expired
        );
        assert_eq!(map_status(&::stripe::SubscriptionStatus::Trialing), SubscriptionStatus::Trialing);
    }

    #[test]
    fn test_config_debug_redacts_secret() {
        let config = StripeConfig {
            secret_key: "sk_test_secret".into(),
            tier_products: HashMap::new(),
        };
        assert!(!format!("{:?}", config).contains("sk_test_secret"));
    }

    #[tokio::test]
    async fn test_identity_without_customer_has_nothing_to_look_up() {
        let lookup = StripeLookup::new(
            StripeConfig {
                secret_key: "sk_test_secret".into(),
                tier_products: HashMap::new(),
            },
            Arc::new(ClientCache::new(std::time::Duration::from_secs(60))),
        );
        let identity = Identity::new("a", "a@example.com", Utc::now());
        assert!(lookup.lookup(&identity).await.unwrap().is_empty());
    }
}
