//! Reconciliation settings
//!
//! ## Configuration
//!
//! ```bash
//! RECONCILE_BATCH_CONCURRENCY=8
//! RECONCILE_LIVE_LOOKUP_TIMEOUT_SECS=10
//! RECONCILE_STALE_SYNC_DAYS=7
//! RECONCILE_PROVIDER_FALLBACK=aggregated      # aggregated, keep_current
//! RECONCILE_LEGACY_PROVIDER=stripe
//! RECONCILE_CLIENT_CACHE_TTL_SECS=300
//! RECONCILE_SCORING_WEIGHTS='{"pro_active":1000,"founding_member":500}'
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::Provider;

/// Provider clients are never cached longer than this
pub const MAX_CLIENT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Points awarded when electing the canonical identity of a duplicate group.
/// Missing keys in the JSON override keep their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub pro_active: i64,
    pub premium_active: i64,
    pub founding_member: i64,
    pub stripe_customer: i64,
    pub most_recently_updated: i64,
    pub oldest_created: i64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            pro_active: 1000,
            premium_active: 800,
            founding_member: 500,
            stripe_customer: 200,
            most_recently_updated: 50,
            oldest_created: 10,
        }
    }
}

/// What to conclude when the live provider lookup fails or times out
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFallback {
    /// Resolve from stored subscriptions as if no lookup was configured
    #[default]
    Aggregated,
    /// Leave the stored tier, level and status untouched
    KeepCurrent,
}

impl ProviderFallback {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "aggregated" | "aggregate" => Some(Self::Aggregated),
            "keep_current" | "keep" => Some(Self::KeepCurrent),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    pub scoring: ScoringWeights,
    pub provider_fallback: ProviderFallback,
    /// Identities processed concurrently by batch jobs
    pub batch_concurrency: usize,
    pub live_lookup_timeout: Duration,
    /// Age after which a billed identity's last sync counts as stale
    pub stale_sync_after: chrono::Duration,
    /// Provider whose legacy rows may only be joined by owner email
    pub legacy_provider: Provider,
    pub client_cache_ttl: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringWeights::default(),
            provider_fallback: ProviderFallback::default(),
            batch_concurrency: 8,
            live_lookup_timeout: Duration::from_secs(10),
            stale_sync_after: chrono::Duration::days(7),
            legacy_provider: Provider::Stripe,
            client_cache_ttl: MAX_CLIENT_CACHE_TTL,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl ReconcileConfig {
    /// Unset or unparsable variables fall back to defaults with a warning
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let scoring = match std::env::var("RECONCILE_SCORING_WEIGHTS") {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Invalid RECONCILE_SCORING_WEIGHTS, using defaults");
                ScoringWeights::default()
            }),
            Err(_) => ScoringWeights::default(),
        };

        let provider_fallback = std::env::var("RECONCILE_PROVIDER_FALLBACK")
            .ok()
            .and_then(|raw| {
                let parsed = ProviderFallback::parse(&raw);
                if parsed.is_none() {
                    tracing::warn!(value = %raw, "Unknown RECONCILE_PROVIDER_FALLBACK");
                }
                parsed
            })
            .unwrap_or(defaults.provider_fallback);

        let client_cache_ttl = env_parse::<u64>("RECONCILE_CLIENT_CACHE_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.client_cache_ttl)
            .min(MAX_CLIENT_CACHE_TTL);

        Self {
            scoring,
            provider_fallback,
            batch_concurrency: env_parse::<usize>("RECONCILE_BATCH_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_concurrency),
            live_lookup_timeout: env_parse::<u64>("RECONCILE_LIVE_LOOKUP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.live_lookup_timeout),
            stale_sync_after: env_parse::<i64>("RECONCILE_STALE_SYNC_DAYS")
                .map(chrono::Duration::days)
                .unwrap_or(defaults.stale_sync_after),
            legacy_provider: std::env::var("RECONCILE_LEGACY_PROVIDER")
                .ok()
                .and_then(|raw| Provider::normalize(&raw))
                .unwrap_or(defaults.legacy_provider),
            client_cache_ttl,
        }
    }
}
