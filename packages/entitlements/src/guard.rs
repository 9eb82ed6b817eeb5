//! Billing-identifier conflict guard.
//!
//! A Stripe linkage, once present, is never displaced by an App Store one, and
//! an App Store transaction id can never be linked to two identities.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::follow_merged;
use crate::model::{Identity, Provider, Subscription};
use crate::store::EntitlementStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The identity bills through Stripe
    StripeLinked,
    /// The identity already holds a different App Store id
    AlreadyLinked,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedIdentifier {
    pub field: String,
    pub value: String,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppStoreDecision {
    Attach,
    Unchanged,
    Skip(SkipReason),
}

/// Decide whether `transaction_id` may be attached to `identity`.
///
/// `linked_to` is the identity currently holding that id, if any. Linking to a
/// different identity is refused with `CONFLICT`.
pub fn check_app_store_attach(
    identity: &Identity,
    transaction_id: &str,
    linked_to: Option<&Identity>,
) -> Result<AppStoreDecision> {
    if identity.app_store_transaction_id.as_deref() == Some(transaction_id) {
        return Ok(AppStoreDecision::Unchanged);
    }
    if identity.stripe_customer_id.is_some() {
        return Ok(AppStoreDecision::Skip(SkipReason::StripeLinked));
    }
    if identity.app_store_transaction_id.is_some() {
        return Ok(AppStoreDecision::Skip(SkipReason::AlreadyLinked));
    }
    if let Some(owner) = linked_to
        && owner.id != identity.id
    {
        return Err(crate::conflict!(
            "App Store transaction {} is linked to another identity",
            transaction_id
        ));
    }
    Ok(AppStoreDecision::Attach)
}

/// Store-backed variant of [`check_app_store_attach`]. A merged holder stands
/// for the identity it was merged into. Holders listed in `aliases` are
/// duplicates being merged into `identity` and do not conflict.
pub async fn guard_app_store_attach(
    store: &dyn EntitlementStore,
    identity: &Identity,
    transaction_id: &str,
    aliases: &[String],
) -> Result<AppStoreDecision> {
    let linked_to = match store.find_identity_by_app_store_id(transaction_id).await? {
        Some(holder) if aliases.contains(&holder.id) => None,
        Some(holder) => Some(follow_merged(store, holder).await?),
        None => None,
    };
    check_app_store_attach(identity, transaction_id, linked_to.as_ref())
}

/// Refuse re-owning an App Store subscription that already belongs to
/// someone else
pub fn check_subscription_owner(existing: Option<&Subscription>, owner_id: &str) -> Result<()> {
    let Some(existing) = existing else {
        return Ok(());
    };
    if existing.provider != Provider::AppStore {
        return Ok(());
    }
    match existing.identity_id.as_deref() {
        Some(current) if current != owner_id => Err(crate::conflict!(
            "App Store subscription {} belongs to another identity",
            existing.provider_subscription_id
        )),
        _ => Ok(()),
    }
}
