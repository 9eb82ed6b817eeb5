//! Operation surface for the reconciliation core.
//!
//! Every mutating operation takes a `dry_run` flag. Dry runs perform the same
//! reads and produce the same serialized result; only persistence is skipped.
//! Only authorization failures abort a batch; everything else is collected per
//! identity.
//!
//! ```rust,ignore
//! let service = ReconcileService::new(store, ReconcileConfig::from_env())
//!     .with_live_lookup(Arc::new(StripeLookup::new(stripe_config, clients)));
//! let result = service
//!     .reconcile_one(&Actor::system(), "someone@example.com", ReconcileOptions::default())
//!     .await?;
//! ```

use chrono::{DateTime, Utc};
use futures::{StreamExt, future, stream};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::aggregate::list_subscriptions;
use crate::config::ReconcileConfig;
use crate::drift::detect;
use crate::error::{ReconcileError, Result};
use crate::guard::{SkippedIdentifier, check_subscription_owner};
use crate::identity::{MergeResult, apply_merge, follow_merged, resolve_canonical};
use crate::ingest::{SubscriptionEvent, merge_incoming};
use crate::model::{
    Actor, DriftRecord, EntitlementSnapshot, EntitlementStatus, Identity, Provider, Subscription,
    SubscriptionStatus, SyncMeta, SyncState, Tier, normalize_email,
};
use crate::precedence::{LiveLookup, LiveOutcome, Resolution, resolve};
use crate::provider::ProviderLookup;
use crate::store::{EntitlementStore, IdentityQuery, SyncUpdate};
use crate::writer;

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.write() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReconcileOptions {
    pub dry_run: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BatchOptions {
    pub dry_run: bool,
    pub limit: Option<usize>,
    pub tier_filter: Option<Tier>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MergeAllOptions {
    pub dry_run: bool,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconcileResult {
    pub identity_id: String,
    pub email: String,
    pub before: EntitlementSnapshot,
    pub after: EntitlementSnapshot,
    pub changed: bool,
    pub applied: bool,
    /// Billing identifiers or provider fields were corrected without a tier change
    pub identifiers_changed: bool,
    pub resolution: Resolution,
    pub merge: Option<MergeResult>,
    pub skipped_identifiers: Vec<SkippedIdentifier>,
    #[serde(skip)]
    pub persisted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchItem<T> {
    Ok { key: String, result: T },
    Error { key: String, error: ReconcileError },
}

impl<T> BatchItem<T> {
    pub fn key(&self) -> &str {
        match self {
            BatchItem::Ok { key, .. } | BatchItem::Error { key, .. } => key,
        }
    }

    pub fn result(&self) -> Option<&T> {
        match self {
            BatchItem::Ok { result, .. } => Some(result),
            BatchItem::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ReconcileError> {
        match self {
            BatchItem::Ok { .. } => None,
            BatchItem::Error { error, .. } => Some(error),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchResult<T> {
    pub total: usize,
    pub processed: usize,
    pub changed: usize,
    pub failed: usize,
    /// Cancelled before every item was started
    pub stopped_early: bool,
    pub results: Vec<BatchItem<T>>,
}

impl<T> BatchResult<T> {
    fn new(
        total: usize,
        results: Vec<BatchItem<T>>,
        stopped_early: bool,
        changed: impl Fn(&T) -> bool,
    ) -> Self {
        Self {
            total,
            processed: results.len(),
            changed: results
                .iter()
                .filter_map(BatchItem::result)
                .filter(|r| changed(*r))
                .count(),
            failed: results.iter().filter(|r| r.error().is_some()).count(),
            stopped_early,
            results,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DriftScanError {
    pub identity_id: String,
    pub error: ReconcileError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DriftScan {
    pub scanned: usize,
    pub records: Vec<DriftRecord>,
    pub errors: Vec<DriftScanError>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntitlementCheck {
    pub identity_id: String,
    pub tier: Tier,
    pub status: EntitlementStatus,
    pub has_paid_access: bool,
    pub has_pro_access: bool,
}

impl EntitlementCheck {
    pub fn of(identity: &Identity) -> Self {
        let entitlement = &identity.entitlement;
        let has_paid_access = entitlement.tier != Tier::Free && entitlement.status.grants_access();
        Self {
            identity_id: identity.id.clone(),
            tier: entitlement.tier,
            status: entitlement.status,
            has_paid_access,
            has_pro_access: has_paid_access && entitlement.tier == Tier::Pro,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    pub subscription: Subscription,
    pub owner_id: Option<String>,
    pub warnings: Vec<String>,
    pub reconcile: Option<ReconcileResult>,
}

/// Deterministic id for identities created by an admin grant
pub fn granted_identity_id(email: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, normalize_email(email).as_bytes()).to_string()
}

pub fn manual_subscription_id(identity_id: &str) -> String {
    format!("manual:{}", identity_id)
}

/// One identity to reconcile, with what the caller already knows about it
struct Target {
    identity: Identity,
    before: EntitlementSnapshot,
    aliases: Vec<String>,
    /// Subscriptions not yet (or never, in a dry run) persisted
    overlay: Vec<Subscription>,
    merge: Option<MergeResult>,
}

impl Target {
    fn new(identity: Identity) -> Self {
        Self {
            before: EntitlementSnapshot::from(&identity),
            identity,
            aliases: Vec::new(),
            overlay: Vec::new(),
            merge: None,
        }
    }

    fn with_overlay(mut self, overlay: Vec<Subscription>) -> Self {
        self.overlay = overlay;
        self
    }
}

enum BatchTarget {
    Email(String),
    /// Identity with no usable email
    Identity(Identity),
}

#[derive(Clone, Debug)]
pub struct ReconcileService {
    store: Arc<dyn EntitlementStore>,
    config: Arc<ReconcileConfig>,
    live: Option<Arc<dyn ProviderLookup>>,
    clock: Arc<dyn Clock>,
}

impl ReconcileService {
    pub fn new(store: Arc<dyn EntitlementStore>, config: ReconcileConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            live: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_live_lookup(mut self, lookup: Arc<dyn ProviderLookup>) -> Self {
        self.live = Some(lookup);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn EntitlementStore> {
        &self.store
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    fn authorize(&self, actor: &Actor, operation: &str) -> Result<()> {
        if actor.is_admin() {
            Ok(())
        } else {
            Err(crate::forbidden!("{} may not {}", actor.id, operation))
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Dedup, aggregate, resolve and write one person's entitlement
    #[tracing::instrument(name = "reconcile_one", skip(self, actor, options), fields(actor = %actor.id, dry_run = options.dry_run))]
    pub async fn reconcile_one(
        &self,
        actor: &Actor,
        email: &str,
        options: ReconcileOptions,
    ) -> Result<ReconcileResult> {
        self.authorize(actor, "reconcile entitlements")?;
        self.reconcile_email(email, options.dry_run).await
    }

    /// Reconcile every enabled, unmerged identity, one email group at a time.
    /// Results are keyed by normalized email; identities without an email are
    /// keyed by id.
    #[tracing::instrument(name = "reconcile_batch", skip(self, actor, cancel), fields(actor = %actor.id))]
    pub async fn reconcile_batch(
        &self,
        actor: &Actor,
        options: BatchOptions,
        cancel: &CancellationToken,
    ) -> Result<BatchResult<ReconcileResult>> {
        self.authorize(actor, "reconcile entitlements")?;

        let identities = self
            .store
            .list_identities(IdentityQuery {
                include_disabled: false,
                tier: options.tier_filter,
                limit: None,
            })
            .await?;
        let mut groups: BTreeMap<String, BatchTarget> = BTreeMap::new();
        for identity in identities.into_iter().filter(|i| !i.is_merged()) {
            let email = normalize_email(&identity.email);
            if email.is_empty() {
                groups.insert(identity.id.clone(), BatchTarget::Identity(identity));
            } else {
                groups.entry(email.clone()).or_insert(BatchTarget::Email(email));
            }
        }
        let mut items: Vec<(String, BatchTarget)> = groups.into_iter().collect();
        if let Some(limit) = options.limit {
            items.truncate(limit);
        }
        let total = items.len();

        let (results, stopped_early) = self
            .run_batch(items, cancel, |target| async move {
                match target {
                    BatchTarget::Email(email) => self.reconcile_email(&email, options.dry_run).await,
                    BatchTarget::Identity(identity) => {
                        self.reconcile_target(Target::new(identity), options.dry_run)
                            .await
                    }
                }
            })
            .await?;

        let batch = BatchResult::new(total, results, stopped_early, |r| r.changed);
        tracing::info!(
            processed = batch.processed,
            changed = batch.changed,
            failed = batch.failed,
            stopped_early = batch.stopped_early,
            "Batch reconcile finished"
        );
        Ok(batch)
    }

    #[tracing::instrument(name = "merge_duplicates", skip(self, actor, options), fields(actor = %actor.id, dry_run = options.dry_run))]
    pub async fn merge_duplicates(
        &self,
        actor: &Actor,
        email: &str,
        options: ReconcileOptions,
    ) -> Result<MergeResult> {
        self.authorize(actor, "merge identities")?;
        self.merge_group(email, options.dry_run).await
    }

    /// Dedup sweep over every email held by more than one enabled identity
    #[tracing::instrument(name = "merge_all_duplicates", skip(self, actor, cancel), fields(actor = %actor.id))]
    pub async fn merge_all_duplicates(
        &self,
        actor: &Actor,
        options: MergeAllOptions,
        cancel: &CancellationToken,
    ) -> Result<BatchResult<MergeResult>> {
        self.authorize(actor, "merge identities")?;

        let mut emails = self.store.duplicate_emails().await?;
        if let Some(limit) = options.limit {
            emails.truncate(limit);
        }
        let items: Vec<(String, String)> = emails.into_iter().map(|e| (e.clone(), e)).collect();
        let total = items.len();

        let (results, stopped_early) = self
            .run_batch(items, cancel, |email| async move {
                self.merge_group(&email, options.dry_run).await
            })
            .await?;

        let batch = BatchResult::new(total, results, stopped_early, |r| r.changed);
        tracing::info!(
            groups = batch.processed,
            merged = batch.changed,
            failed = batch.failed,
            "Dedup sweep finished"
        );
        Ok(batch)
    }

    /// Regenerate drift findings for all enabled identities. Unresolved
    /// findings of disabled or merged identities are cleared.
    #[tracing::instrument(name = "scan_drift", skip(self, actor), fields(actor = %actor.id))]
    pub async fn scan_drift(&self, actor: &Actor) -> Result<DriftScan> {
        self.authorize(actor, "scan drift")?;

        let identities = self
            .store
            .list_identities(IdentityQuery {
                include_disabled: true,
                ..Default::default()
            })
            .await?;
        // Retired identities get no findings but their old ones are cleared
        let (items, retired): (Vec<Identity>, Vec<Identity>) = identities
            .into_iter()
            .partition(|i| !i.disabled && !i.is_merged());
        let items: Vec<(String, Identity)> = items.into_iter().map(|i| (i.id.clone(), i)).collect();
        let now = self.clock.now();
        let never = CancellationToken::new();

        let (results, _) = self
            .run_batch(items, &never, |identity| async move {
                let subs = list_subscriptions(
                    self.store.as_ref(),
                    &identity,
                    &[],
                    self.config.legacy_provider,
                )
                .await?;
                Ok(detect(&identity, &subs, self.config.stale_sync_after, now))
            })
            .await?;

        let mut scanned = 0;
        let mut scope: Vec<String> = retired.into_iter().map(|i| i.id).collect();
        let mut records = Vec::new();
        let mut errors = Vec::new();
        for item in results {
            match item {
                BatchItem::Ok { key, result } => {
                    scanned += 1;
                    scope.push(key);
                    records.extend(result);
                }
                BatchItem::Error { key, error } => errors.push(DriftScanError {
                    identity_id: key,
                    error,
                }),
            }
        }

        self.store.replace_unresolved_drift(&scope, &records).await?;

        tracing::info!(
            scanned,
            cleared_scope = scope.len(),
            findings = records.len(),
            failed = errors.len(),
            "Drift scan finished"
        );
        Ok(DriftScan {
            scanned,
            records,
            errors,
        })
    }

    /// Access check from the stored entitlement; follows merge forwarding
    pub async fn check_entitlement(&self, identity_id: &str) -> Result<EntitlementCheck> {
        let identity = self
            .store
            .get_identity(identity_id)
            .await?
            .ok_or_else(|| crate::not_found!("Identity {} not found", identity_id))?;
        let identity = follow_merged(self.store.as_ref(), identity).await?;
        Ok(EntitlementCheck::of(&identity))
    }

    /// Grant `tier` through a manual subscription, creating the identity if needed
    #[tracing::instrument(name = "grant", skip(self, actor, options), fields(actor = %actor.id, tier = %tier, dry_run = options.dry_run))]
    pub async fn grant(
        &self,
        actor: &Actor,
        email: &str,
        tier: Tier,
        options: ReconcileOptions,
    ) -> Result<ReconcileResult> {
        self.authorize(actor, "grant entitlements")?;
        let normalized = normalize_email(email);
        if normalized.is_empty() {
            return Err(ReconcileError::malformed("Email is required"));
        }

        let now = self.clock.now();
        let (identity, created) = match self.owner_for_email(&normalized).await? {
            Some(identity) => (identity, false),
            None => (
                Identity::new(granted_identity_id(&normalized), email.trim(), now),
                true,
            ),
        };

        let psid = manual_subscription_id(&identity.id);
        let existing = self.store.get_subscription(Provider::Manual, &psid).await?;
        let incoming = Subscription {
            identity_id: Some(identity.id.clone()),
            owner_email: Some(identity.email.clone()),
            provider: Provider::Manual,
            provider_subscription_id: psid,
            customer_id: None,
            status: SubscriptionStatus::Active,
            tier,
            interval: None,
            period_start: Some(now),
            period_end: None,
            cancel_at_period_end: false,
            first_started_at: Some(now),
        };
        let (mut grant, _) = merge_incoming(existing.as_ref(), incoming);
        // Grants are open-ended even when re-granting after a revoke
        grant.period_end = None;

        if !options.dry_run {
            if created {
                self.store.insert_identity(&identity).await?;
                tracing::info!(identity_id = %identity.id, "Created identity for grant");
            }
            self.store.upsert_subscription(&grant).await?;
        }

        self.reconcile_target(Target::new(identity).with_overlay(vec![grant]), options.dry_run)
            .await
    }

    /// Cancel the manual subscription created by [`Self::grant`]
    #[tracing::instrument(name = "revoke", skip(self, actor, options), fields(actor = %actor.id, dry_run = options.dry_run))]
    pub async fn revoke(
        &self,
        actor: &Actor,
        email: &str,
        options: ReconcileOptions,
    ) -> Result<ReconcileResult> {
        self.authorize(actor, "revoke entitlements")?;

        let identity = self
            .owner_for_email(email)
            .await?
            .ok_or_else(|| crate::not_found!("No identity for {}", normalize_email(email)))?;
        let psid = manual_subscription_id(&identity.id);
        let mut grant = self
            .store
            .get_subscription(Provider::Manual, &psid)
            .await?
            .ok_or_else(|| crate::not_found!("No manual grant for {}", identity.id))?;

        if !grant.status.is_terminal() {
            grant.status = SubscriptionStatus::Canceled;
            grant.period_end = Some(self.clock.now());
            grant.cancel_at_period_end = false;
            if !options.dry_run {
                self.store.upsert_subscription(&grant).await?;
            }
        }

        self.reconcile_target(Target::new(identity).with_overlay(vec![grant]), options.dry_run)
            .await
    }

    /// Store a provider subscription fact and reconcile its owner
    #[tracing::instrument(
        name = "ingest_subscription",
        skip(self, actor, event, options),
        fields(actor = %actor.id, provider = %event.provider, subscription = %event.provider_subscription_id, dry_run = options.dry_run)
    )]
    pub async fn ingest_subscription(
        &self,
        actor: &Actor,
        event: &SubscriptionEvent,
        options: ReconcileOptions,
    ) -> Result<IngestResult> {
        self.authorize(actor, "ingest subscriptions")?;

        let mut incoming = event.normalize()?;
        let existing = self
            .store
            .get_subscription(incoming.provider, &incoming.provider_subscription_id)
            .await?;

        let owner = match (&event.identity_id, &event.email) {
            (Some(id), _) => Some(self.identity_following_merges(id).await?),
            (None, Some(email)) => self.owner_for_email(email).await?,
            (None, None) => match existing.as_ref().and_then(|s| s.identity_id.as_deref()) {
                Some(id) => Some(self.identity_following_merges(id).await?),
                None => None,
            },
        };

        if let Some(owner) = &owner {
            if incoming.provider == Provider::AppStore {
                self.guard_takeover(existing.as_ref(), &incoming.provider_subscription_id, owner)
                    .await?;
            }
            incoming.identity_id = Some(owner.id.clone());
            if incoming.owner_email.is_none() {
                incoming.owner_email = Some(owner.email.clone());
            }
        }

        let (subscription, warnings) = merge_incoming(existing.as_ref(), incoming);
        let now = self.clock.now();

        if !options.dry_run {
            self.store.upsert_subscription(&subscription).await?;
            if let Some(owner) = &owner {
                self.store
                    .record_sync(&owner.id, SyncUpdate::Ok { at: now })
                    .await?;
            }
        }

        let reconcile = match owner {
            Some(mut owner) => {
                owner.sync = SyncMeta {
                    state: SyncState::Ok,
                    last_synced_at: Some(now),
                    last_error: None,
                };
                let target = Target::new(owner).with_overlay(vec![subscription.clone()]);
                Some(self.reconcile_target(target, options.dry_run).await?)
            }
            None => {
                tracing::warn!("No owner found for subscription, stored unlinked");
                None
            }
        };

        Ok(IngestResult {
            owner_id: reconcile.as_ref().map(|r| r.identity_id.clone()),
            subscription,
            warnings,
            reconcile,
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn merge_group(&self, email: &str, dry_run: bool) -> Result<MergeResult> {
        let identities = self.store.find_identities_by_email(email).await?;
        let plan = resolve_canonical(&identities, &self.config.scoring)
            .ok_or_else(|| crate::not_found!("No identity for {}", normalize_email(email)))?;
        apply_merge(self.store.as_ref(), &plan, dry_run, self.clock.now()).await
    }

    /// Merge the email's duplicates, then reconcile the canonical identity
    async fn reconcile_email(&self, email: &str, dry_run: bool) -> Result<ReconcileResult> {
        let identities = self.store.find_identities_by_email(email).await?;
        let plan = resolve_canonical(&identities, &self.config.scoring)
            .ok_or_else(|| crate::not_found!("No identity for {}", normalize_email(email)))?;

        let merge = if plan.is_noop() {
            None
        } else {
            Some(apply_merge(self.store.as_ref(), &plan, dry_run, self.clock.now()).await?)
        };

        let target = Target {
            before: EntitlementSnapshot::from(&plan.canonical),
            aliases: plan.duplicate_ids(),
            identity: plan.canonical_after,
            overlay: Vec::new(),
            merge,
        };
        self.reconcile_target(target, dry_run).await
    }

    async fn reconcile_target(&self, target: Target, dry_run: bool) -> Result<ReconcileResult> {
        let now = self.clock.now();
        let Target {
            mut identity,
            before,
            aliases,
            overlay,
            merge,
        } = target;

        let mut subs = list_subscriptions(
            self.store.as_ref(),
            &identity,
            &aliases,
            self.config.legacy_provider,
        )
        .await?;
        if !overlay.is_empty() {
            let mut by_key: BTreeMap<(Provider, String), Subscription> = subs
                .into_iter()
                .map(|s| ((s.provider, s.provider_subscription_id.clone()), s))
                .collect();
            for sub in overlay {
                by_key.insert((sub.provider, sub.provider_subscription_id.clone()), sub);
            }
            subs = by_key.into_values().collect();
        }

        let live = self.live.as_deref().map(|provider| LiveLookup {
            provider,
            timeout: self.config.live_lookup_timeout,
            fallback: self.config.provider_fallback,
        });
        let resolution = resolve(&identity, &subs, now, live).await;

        match &resolution.live {
            Some(LiveOutcome::Found(found)) => {
                identity.sync = SyncMeta {
                    state: SyncState::Ok,
                    last_synced_at: Some(now),
                    last_error: None,
                };
                if !dry_run {
                    for sub in found {
                        let existing = self
                            .store
                            .get_subscription(sub.provider, &sub.provider_subscription_id)
                            .await?;
                        let mut sub = sub.clone();
                        sub.identity_id.get_or_insert_with(|| identity.id.clone());
                        let (merged, _) = merge_incoming(existing.as_ref(), sub);
                        self.store.upsert_subscription(&merged).await?;
                    }
                    self.store
                        .record_sync(&identity.id, SyncUpdate::Ok { at: now })
                        .await?;
                }
            }
            Some(LiveOutcome::Failed(error)) => {
                identity.sync.state = SyncState::Error;
                identity.sync.last_error = Some(error.clone());
                if !dry_run {
                    self.store
                        .record_sync(
                            &identity.id,
                            SyncUpdate::Failed {
                                at: now,
                                error: error.clone(),
                            },
                        )
                        .await?;
                }
            }
            None => {}
        }

        let outcome = writer::apply(
            self.store.as_ref(),
            &identity,
            &resolution,
            &aliases,
            dry_run,
            now,
        )
        .await?;

        tracing::info!(
            identity_id = %identity.id,
            changed = resolution.changed,
            applied = outcome.applied,
            identifiers_changed = outcome.identifiers_changed,
            dry_run,
            "Reconciled identity"
        );

        Ok(ReconcileResult {
            identity_id: identity.id.clone(),
            email: identity.email.clone(),
            before,
            after: outcome.after,
            changed: resolution.changed,
            applied: outcome.applied,
            identifiers_changed: outcome.identifiers_changed,
            merge,
            skipped_identifiers: outcome.skipped_identifiers,
            persisted: outcome.persisted,
            resolution,
        })
    }

    /// Run `op` over `items` with bounded concurrency. Once `cancel` fires no
    /// new item starts; in-flight ones finish. Results are ordered by key.
    async fn run_batch<I, T, F, Fut>(
        &self,
        items: Vec<(String, I)>,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<(Vec<BatchItem<T>>, bool)>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let total = items.len();
        let mut results: Vec<BatchItem<T>> = stream::iter(items)
            .take_while(|_| future::ready(!cancel.is_cancelled()))
            .map(|(key, item)| {
                let work = op(item);
                async move {
                    match work.await {
                        Ok(result) => BatchItem::Ok { key, result },
                        Err(error) => {
                            tracing::warn!(key = %key, error = %error, "Batch item failed");
                            BatchItem::Error { key, error }
                        }
                    }
                }
            })
            .buffer_unordered(self.config.batch_concurrency.max(1))
            .collect()
            .await;

        if let Some(error) = results
            .iter()
            .filter_map(BatchItem::error)
            .find(|e| e.kind().aborts_request())
        {
            return Err(error.clone());
        }

        results.sort_by(|a, b| a.key().cmp(b.key()));
        let stopped_early = results.len() < total;
        if stopped_early {
            tracing::info!(done = results.len(), total, "Batch cancelled");
        }
        Ok((results, stopped_early))
    }

    /// Canonical owner of `email` without merging anything
    async fn owner_for_email(&self, email: &str) -> Result<Option<Identity>> {
        let identities = self.store.find_identities_by_email(email).await?;
        match resolve_canonical(&identities, &self.config.scoring) {
            Some(plan) => Ok(Some(follow_merged(self.store.as_ref(), plan.canonical).await?)),
            None => Ok(None),
        }
    }

    async fn identity_following_merges(&self, id: &str) -> Result<Identity> {
        let identity = self
            .store
            .get_identity(id)
            .await?
            .ok_or_else(|| crate::not_found!("Identity {} not found", id))?;
        follow_merged(self.store.as_ref(), identity).await
    }

    /// An App Store subscription or transaction id may not move between people
    async fn guard_takeover(
        &self,
        existing: Option<&Subscription>,
        transaction_id: &str,
        owner: &Identity,
    ) -> Result<()> {
        if let Some(existing) = existing
            && let Some(previous) = existing.identity_id.as_deref()
            && previous != owner.id
        {
            // Rows still pointing at a merged duplicate belong to its canonical identity
            let previous_owner = match self.store.get_identity(previous).await? {
                Some(identity) => follow_merged(self.store.as_ref(), identity).await?.id,
                None => previous.to_string(),
            };
            let mut resolved = existing.clone();
            resolved.identity_id = Some(previous_owner);
            check_subscription_owner(Some(&resolved), &owner.id)?;
        }

        if let Some(linked) = self.store.find_identity_by_app_store_id(transaction_id).await? {
            let holder = follow_merged(self.store.as_ref(), linked).await?;
            if holder.id != owner.id {
                return Err(crate::conflict!(
                    "App Store transaction {} is linked to another identity",
                    transaction_id
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn service() -> (Arc<MemoryStore>, ReconcileService) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let service = ReconcileService::new(store.clone(), ReconcileConfig::default())
            .with_clock(clock);
        (store, service)
    }

    #[tokio::test]
    async fn test_non_admin_is_forbidden() {
        let (_, service) = service();
        let err = service
            .reconcile_one(&Actor::user("u1"), "a@example.com", ReconcileOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_unknown_email_is_not_found() {
        let (_, service) = service();
        let err = service
            .reconcile_one(&Actor::system(), "nobody@example.com", ReconcileOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_grant_then_revoke() {
        let (store, service) = service();
        let admin = Actor::admin("ops");

        let granted = service
            .grant(&admin, "New@Example.com", Tier::Pro, ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(granted.identity_id, granted_identity_id("new@example.com"));
        assert_eq!(granted.after.tier, Tier::Pro);

        let check = service.check_entitlement(&granted.identity_id).await.unwrap();
        assert!(check.has_paid_access && check.has_pro_access);

        let revoked = service
            .revoke(&admin, "new@example.com", ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(revoked.after.tier, Tier::Free);
        assert_eq!(revoked.after.status, EntitlementStatus::Canceled);

        let sub = store
            .get_subscription(Provider::Manual, &manual_subscription_id(&granted.identity_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_check_entitlement_follows_merge() {
        let (store, service) = service();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut canonical = Identity::new("c", "x@example.com", now);
        canonical.entitlement.tier = Tier::Premium;
        canonical.entitlement.level = crate::model::Level::Paid;
        canonical.entitlement.status = EntitlementStatus::Trialing;
        let mut loser = Identity::new("l", "x@example.com", now);
        loser.merged_into = Some("c".into());
        loser.disabled = true;
        store.insert_identity(&canonical).await.unwrap();
        store.insert_identity(&loser).await.unwrap();

        let check = service.check_entitlement("l").await.unwrap();
        assert_eq!(check.identity_id, "c");
        assert!(check.has_paid_access);
        assert!(!check.has_pro_access);
    }

    #[test]
    fn test_granted_id_is_stable() {
        assert_eq!(
            granted_identity_id(" Someone@Example.com"),
            granted_identity_id("someone@example.com")
        );
    }
}
