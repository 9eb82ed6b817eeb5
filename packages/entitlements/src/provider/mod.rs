//! Live provider lookups.
//!
//! The core never talks to a payment provider directly. A [`ProviderLookup`]
//! is handed to reconciliation and only consulted when no stored subscription
//! is active. Mobile-store receipt verification lives outside this crate and
//! plugs in through the same trait.

mod stripe;

pub use self::stripe::{StripeConfig, StripeLookup};

use async_trait::async_trait;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::config::MAX_CLIENT_CACHE_TTL;
use crate::error::Result;
use crate::model::{Identity, Subscription};

#[async_trait]
pub trait ProviderLookup: Send + Sync + Debug {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Current subscriptions the provider holds for this identity
    async fn lookup(&self, identity: &Identity) -> Result<Vec<Subscription>>;
}

/// Hex blake3 digest, so raw secrets never become cache keys
pub fn fingerprint(secret: &str) -> String {
    blake3::hash(secret.as_bytes()).to_hex().to_string()
}

/// Short-lived cache of provider client objects keyed by credential fingerprint.
///
/// Seeing a new credential drops every client built from an older one.
pub struct ClientCache<C> {
    clients: Cache<String, Arc<C>>,
    current: Mutex<Option<String>>,
}

impl<C: Send + Sync + 'static> ClientCache<C> {
    /// TTL is capped at five minutes
    pub fn new(ttl: Duration) -> Self {
        Self {
            clients: Cache::builder()
                .max_capacity(16)
                .time_to_live(ttl.min(MAX_CLIENT_CACHE_TTL))
                .build(),
            current: Mutex::new(None),
        }
    }

    pub fn get_or_create(&self, secret: &str, build: impl FnOnce() -> C) -> Arc<C> {
        let key = fingerprint(secret);
        {
            let mut current = self.current.lock();
            if current.as_deref() != Some(key.as_str()) {
                if current.is_some() {
                    tracing::info!("Provider credentials changed, dropping cached clients");
                    self.clients.invalidate_all();
                }
                *current = Some(key.clone());
            }
        }
        self.clients.get_with(key, || Arc::new(build()))
    }

    pub fn invalidate(&self) {
        self.clients.invalidate_all();
        *self.current.lock() = None;
    }
}

impl<C> Debug for ClientCache<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCache")
            .field("entries", &self.clients.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fingerprint_hides_secret() {
        let fp = fingerprint("sk_test_123");
        assert_eq!(fp.len(), 64);
        assert!(!fp.contains("sk_test"));
        assert_eq!(fp, fingerprint("sk_test_123"));
    }

    #[test]
    fn test_client_is_reused_until_credentials_change() {
        let cache: ClientCache<String> = ClientCache::new(Duration::from_secs(60));
        let builds = AtomicUsize::new(0);
        let build = |key: &str| {
            builds.fetch_add(1, Ordering::SeqCst);
            key.to_string()
        };

        let first = cache.get_or_create("key-a", || build("key-a"));
        let again = cache.get_or_create("key-a", || build("key-a"));
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let rotated = cache.get_or_create("key-b", || build("key-b"));
        assert_eq!(rotated.as_str(), "key-b");

        // The old credential was dropped with the rotation
        let back = cache.get_or_create("key-a", || build("key-a"));
        assert!(!Arc::ptr_eq(&first, &back));
        assert_eq!(builds.load(Ordering::SeqCst), 3);
    }
}
