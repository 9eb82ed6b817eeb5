//! Identity resolution: elect one canonical record per normalized email and
//! move everything the duplicates own onto it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::config::ScoringWeights;
use crate::error::{ReconcileError, Result};
use crate::guard::{AppStoreDecision, check_app_store_attach};
use crate::model::{
    EntitlementSnapshot, EntitlementStatus, Identity, OwnedKind, OwnedRecordMove, OwnerKey,
    Platform, Provider, Tier,
};
use crate::store::EntitlementStore;

/// Longest `merged_into` chain followed before giving up
pub const MERGE_HOP_LIMIT: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub identity_id: String,
    pub score: i64,
}

/// Owner references to rewrite for one duplicate
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reassignment {
    pub from_id: String,
    pub to_id: String,
    pub from_email: String,
    pub to_email: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergePlan {
    pub email: String,
    /// Elected identity as currently stored
    pub canonical: Identity,
    /// Elected identity after provider merge and identifier carry-over
    pub canonical_after: Identity,
    /// Identities to be merged into the canonical one
    pub duplicates: Vec<Identity>,
    pub reassignments: Vec<Reassignment>,
    pub scores: Vec<CandidateScore>,
}

impl MergePlan {
    pub fn duplicate_ids(&self) -> Vec<String> {
        self.duplicates.iter().map(|d| d.id.clone()).collect()
    }

    /// Nothing to merge and the canonical record already holds the merged state
    pub fn is_noop(&self) -> bool {
        self.duplicates.is_empty() && self.canonical_after == self.canonical
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub email: String,
    pub canonical_id: String,
    pub merged_ids: Vec<String>,
    pub scores: Vec<CandidateScore>,
    pub billing_provider: Option<Provider>,
    pub before: EntitlementSnapshot,
    pub after: EntitlementSnapshot,
    pub moves: Vec<OwnedRecordMove>,
    pub changed: bool,
}

fn score(identity: &Identity, group: &[&Identity], weights: &ScoringWeights) -> i64 {
    let mut score = 0;
    let entitlement = &identity.entitlement;
    if entitlement.status == EntitlementStatus::Active {
        match entitlement.tier {
            Tier::Pro => score += weights.pro_active,
            Tier::Premium => score += weights.premium_active,
            Tier::Free => {}
        }
    }
    if identity.founding_member {
        score += weights.founding_member;
    }
    if identity.stripe_customer_id.is_some() {
        score += weights.stripe_customer;
    }
    if group.iter().all(|other| other.updated_at <= identity.updated_at) {
        score += weights.most_recently_updated;
    }
    if group.iter().all(|other| other.created_at >= identity.created_at) {
        score += weights.oldest_created;
    }
    score
}

/// Billing provider of the merged identity. A signal is required for each
/// provider; with none the canonical's existing value stays.
pub fn merged_billing_provider(canonical: &Identity, group: &[&Identity]) -> Option<Provider> {
    let web = group
        .iter()
        .any(|i| i.stripe_customer_id.is_some() || i.platform == Some(Platform::Web));
    if web {
        return Some(Provider::Stripe);
    }
    let mobile = group
        .iter()
        .any(|i| i.app_store_transaction_id.is_some() || i.platform == Some(Platform::Ios));
    if mobile {
        return Some(Provider::AppStore);
    }
    canonical.billing_provider
}

fn single_distinct<'a>(values: impl Iterator<Item = &'a Option<String>>) -> Option<String> {
    let distinct: BTreeSet<&String> = values.flatten().collect();
    if distinct.len() == 1 {
        distinct.into_iter().next().cloned()
    } else {
        None
    }
}

/// Elect the canonical identity among `identities` sharing one normalized email.
///
/// Highest score wins, then the older `created_at`, then the smaller id, so the
/// result does not depend on input order. Already merged identities are only
/// eligible when no unmerged candidate exists. Returns `None` for an empty group.
pub fn resolve_canonical(identities: &[Identity], weights: &ScoringWeights) -> Option<MergePlan> {
    let group: Vec<&Identity> = identities.iter().collect();
    let unmerged: Vec<&Identity> = group.iter().copied().filter(|i| !i.is_merged()).collect();
    let eligible = if unmerged.is_empty() { &group } else { &unmerged };

    let mut scores: Vec<(i64, &Identity)> = eligible
        .iter()
        .map(|i| (score(i, &group, weights), *i))
        .collect();
    scores.sort_by(|(sa, a), (sb, b)| {
        sb.cmp(sa)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    let (_, canonical) = *scores.first()?;
    let canonical = canonical.clone();

    // Identities already forwarded to the winner are done
    let mut duplicates: Vec<Identity> = group
        .iter()
        .filter(|i| i.id != canonical.id && i.merged_into.as_deref() != Some(canonical.id.as_str()))
        .map(|i| (*i).clone())
        .collect();
    duplicates.sort_by(|a, b| a.id.cmp(&b.id));

    let mut canonical_after = canonical.clone();
    canonical_after.billing_provider = merged_billing_provider(&canonical, &group);
    canonical_after.founding_member = group.iter().any(|i| i.founding_member);

    let others: Vec<&Identity> = group.iter().copied().filter(|i| i.id != canonical.id).collect();
    if canonical_after.stripe_customer_id.is_none()
        && let Some(customer_id) = single_distinct(others.iter().map(|i| &i.stripe_customer_id))
    {
        canonical_after.stripe_customer_id = Some(customer_id);
    }
    if let Some(transaction_id) =
        single_distinct(others.iter().map(|i| &i.app_store_transaction_id))
        && matches!(
            check_app_store_attach(&canonical_after, &transaction_id, None),
            Ok(AppStoreDecision::Attach)
        )
    {
        canonical_after.app_store_transaction_id = Some(transaction_id);
    }

    let reassignments = duplicates
        .iter()
        .map(|d| Reassignment {
            from_id: d.id.clone(),
            to_id: canonical.id.clone(),
            from_email: d.email.clone(),
            to_email: canonical.email.clone(),
        })
        .collect();

    let mut scores: Vec<CandidateScore> = scores
        .into_iter()
        .map(|(score, i)| CandidateScore {
            identity_id: i.id.clone(),
            score,
        })
        .collect();
    scores.sort_by(|a, b| match b.score.cmp(&a.score) {
        Ordering::Equal => a.identity_id.cmp(&b.identity_id),
        other => other,
    });

    Some(MergePlan {
        email: canonical.normalized_email(),
        canonical,
        canonical_after,
        duplicates,
        reassignments,
        scores,
    })
}

/// Identity that `identity` has been merged into, following forwarding.
/// Losers keep their billing identifiers after a merge, so anything found
/// through them is owned by the identity returned here.
pub async fn follow_merged(store: &dyn EntitlementStore, mut identity: Identity) -> Result<Identity> {
    for _ in 0..MERGE_HOP_LIMIT {
        let Some(next) = identity.merged_into.clone() else {
            return Ok(identity);
        };
        identity = store
            .get_identity(&next)
            .await?
            .ok_or_else(|| crate::not_found!("Merge target {} not found", next))?;
    }
    if identity.is_merged() {
        return Err(ReconcileError::malformed(format!(
            "Merge chain from {} exceeds {} hops",
            identity.id, MERGE_HOP_LIMIT
        )));
    }
    Ok(identity)
}

/// Owner-reference moves needed to carry out `plan`
pub async fn plan_moves(
    store: &dyn EntitlementStore,
    plan: &MergePlan,
) -> Result<Vec<OwnedRecordMove>> {
    let mut moves = Vec::new();

    for (duplicate, reassignment) in plan.duplicates.iter().zip(&plan.reassignments) {
        for kind in OwnedKind::ALL {
            for owned in store.list_owned(kind, duplicate).await? {
                let key = kind
                    .owner_fields()
                    .iter()
                    .find(|f| f.column == owned.column)
                    .map(|f| f.key);
                let to = match key {
                    Some(OwnerKey::Id) => &reassignment.to_id,
                    Some(OwnerKey::Email) => &reassignment.to_email,
                    None => continue,
                };
                if owned.value == *to {
                    continue;
                }
                moves.push(OwnedRecordMove {
                    kind,
                    record_id: owned.record_id,
                    column: owned.column.to_string(),
                    from: owned.value,
                    to: to.clone(),
                });
            }
        }
    }

    moves.sort_by(|a, b| {
        (a.kind, &a.record_id, &a.column).cmp(&(b.kind, &b.record_id, &b.column))
    });
    moves.dedup();
    Ok(moves)
}

/// Carry out `plan`. Losers are forwarded to the canonical id and disabled,
/// their owned records reassigned. With `dry_run` the same result is computed
/// and nothing is written.
#[tracing::instrument(name = "apply_merge", skip_all, fields(email = %plan.email, canonical_id = %plan.canonical.id, dry_run = dry_run))]
pub async fn apply_merge(
    store: &dyn EntitlementStore,
    plan: &MergePlan,
    dry_run: bool,
    now: DateTime<Utc>,
) -> Result<MergeResult> {
    let moves = plan_moves(store, plan).await?;
    let changed = !plan.is_noop() || !moves.is_empty();

    if changed && !dry_run {
        let moved = store.reassign_owned(&moves).await?;
        if moved != moves.len() as u64 {
            tracing::warn!(
                planned = moves.len(),
                moved,
                "Owned records changed while merging"
            );
        }

        for duplicate in &plan.duplicates {
            let mut loser = duplicate.clone();
            loser.merged_into = Some(plan.canonical.id.clone());
            loser.disabled = true;
            loser.updated_at = now;
            store.save_identity(&loser).await?;
        }

        if plan.canonical_after != plan.canonical {
            let mut canonical = plan.canonical_after.clone();
            canonical.updated_at = now;
            store.save_identity(&canonical).await?;
        }

        tracing::info!(
            merged = plan.duplicates.len(),
            moves = moves.len(),
            "Merged duplicate identities"
        );
    }

    Ok(MergeResult {
        email: plan.email.clone(),
        canonical_id: plan.canonical.id.clone(),
        merged_ids: plan.duplicate_ids(),
        scores: plan.scores.clone(),
        billing_provider: plan.canonical_after.billing_provider,
        before: EntitlementSnapshot::from(&plan.canonical),
        after: EntitlementSnapshot::from(&plan.canonical_after),
        moves,
        changed,
    })
}
