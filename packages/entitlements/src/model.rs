//! Domain types shared by every reconciliation component.
//!
//! Tier, status and provider values arrive from several providers and from
//! years of hand-edited records, so each closed enum owns exactly one
//! `normalize` function. Raw strings are never compared anywhere else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn normalize_token(raw: &str) -> String {
    raw.trim().to_lowercase().replace(['-', ' '], "_")
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Premium,
    Pro,
}

impl Tier {
    /// Unknown or garbled values collapse to `Free`.
    pub fn normalize(raw: &str) -> Self {
        match normalize_token(raw).as_str() {
            "pro" => Tier::Pro,
            "premium" => Tier::Premium,
            _ => Tier::Free,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Tier::Free => 0,
            Tier::Premium => 1,
            Tier::Pro => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
            Tier::Pro => "pro",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    #[default]
    Free,
    Paid,
}

impl Level {
    pub fn from_tier(tier: Tier) -> Self {
        if tier == Tier::Free {
            Level::Free
        } else {
            Level::Paid
        }
    }

    pub fn normalize(raw: &str) -> Self {
        match normalize_token(raw).as_str() {
            "paid" => Level::Paid,
            _ => Level::Free,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Free => "free",
            Level::Paid => "paid",
        }
    }
}

/// Entitlement status stored on an identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    #[default]
    Inactive,
    Active,
    Trialing,
    PastDue,
    Canceled,
    Expired,
}

impl EntitlementStatus {
    pub fn normalize(raw: &str) -> Self {
        match normalize_token(raw).as_str() {
            "active" => Self::Active,
            "trialing" | "trial" => Self::Trialing,
            "past_due" | "pastdue" => Self::PastDue,
            "canceled" | "cancelled" => Self::Canceled,
            "expired" => Self::Expired,
            _ => Self::Inactive,
        }
    }

    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }
}

/// Status of one provider subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Incomplete,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    /// Unknown values map to `Expired` so they can never grant access.
    pub fn normalize(raw: &str) -> Self {
        match normalize_token(raw).as_str() {
            "active" => Self::Active,
            "trialing" | "trial" => Self::Trialing,
            "past_due" | "pastdue" => Self::PastDue,
            "incomplete" => Self::Incomplete,
            "canceled" | "cancelled" | "unpaid" => Self::Canceled,
            _ => Self::Expired,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Expired)
    }

    pub fn to_entitlement(&self) -> EntitlementStatus {
        match self {
            Self::Active | Self::Incomplete => EntitlementStatus::Active,
            Self::Trialing => EntitlementStatus::Trialing,
            Self::PastDue => EntitlementStatus::PastDue,
            Self::Canceled => EntitlementStatus::Canceled,
            Self::Expired => EntitlementStatus::Expired,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Incomplete => "incomplete",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Web checkout processor
    Stripe,
    /// Mobile in-app purchase store
    AppStore,
    Manual,
}

impl Provider {
    pub fn normalize(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "stripe" | "web" | "web_processor" => Some(Provider::Stripe),
            "app_store" | "appstore" | "apple" | "ios" | "mobile_store" => {
                Some(Provider::AppStore)
            }
            "manual" | "admin" => Some(Provider::Manual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Stripe => "stripe",
            Provider::AppStore => "app_store",
            Provider::Manual => "manual",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn provider_label(provider: Option<Provider>) -> &'static str {
    provider.map(|p| p.as_str()).unwrap_or("none")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Web,
    Ios,
}

impl Platform {
    pub fn normalize(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "web" => Some(Platform::Web),
            "ios" | "iphone" | "ipad" => Some(Platform::Ios),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn normalize(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "month" | "monthly" => Some(Self::Month),
            "year" | "yearly" | "annual" => Some(Self::Year),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    None,
    Ok,
    Error,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub tier: Tier,
    pub level: Level,
    pub status: EntitlementStatus,
    /// Provider of the subscription that decided this entitlement
    pub subscription_provider: Option<Provider>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub state: SyncState,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub platform: Option<Platform>,
    pub founding_member: bool,
    pub entitlement: Entitlement,
    pub billing_provider: Option<Provider>,
    pub stripe_customer_id: Option<String>,
    pub app_store_transaction_id: Option<String>,
    pub merged_into: Option<String>,
    pub disabled: bool,
    pub sync: SyncMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the stored row had to be flattened on read
    #[serde(skip)]
    pub needs_flatten: bool,
}

impl Identity {
    pub fn new(id: impl Into<String>, email: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            display_name: None,
            role: Role::User,
            platform: None,
            founding_member: false,
            entitlement: Entitlement::default(),
            billing_provider: None,
            stripe_customer_id: None,
            app_store_transaction_id: None,
            merged_into: None,
            disabled: false,
            sync: SyncMeta::default(),
            created_at: now,
            updated_at: now,
            needs_flatten: false,
        }
    }

    pub fn normalized_email(&self) -> String {
        normalize_email(&self.email)
    }

    pub fn is_merged(&self) -> bool {
        self.merged_into.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub identity_id: Option<String>,
    pub owner_email: Option<String>,
    pub provider: Provider,
    pub provider_subscription_id: String,
    /// Provider-side customer reference (Stripe customer id for web checkout)
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub tier: Tier,
    pub interval: Option<BillingInterval>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub first_started_at: Option<DateTime<Utc>>,
}

/// Entitlement-relevant view of an identity, used for before/after audit payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementSnapshot {
    pub tier: Tier,
    pub level: Level,
    pub status: EntitlementStatus,
    pub billing_provider: Option<Provider>,
    pub subscription_provider: Option<Provider>,
    pub stripe_customer_id: Option<String>,
    pub app_store_transaction_id: Option<String>,
}

impl From<&Identity> for EntitlementSnapshot {
    fn from(identity: &Identity) -> Self {
        Self {
            tier: identity.entitlement.tier,
            level: identity.entitlement.level,
            status: identity.entitlement.status,
            billing_provider: identity.billing_provider,
            subscription_provider: identity.entitlement.subscription_provider,
            stripe_customer_id: identity.stripe_customer_id.clone(),
            app_store_transaction_id: identity.app_store_transaction_id.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftType {
    StaleSync,
    SyncError,
    PaidButFree,
    ProviderMismatch,
    EntitlementMismatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftRecord {
    pub id: String,
    pub identity_id: String,
    pub drift_type: DriftType,
    pub severity: Severity,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
}

/// Caller of an operation. Mutating operations require `Role::Admin`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Admin,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
        }
    }

    /// Provider sync jobs and webhook handlers
    pub fn system() -> Self {
        Self::admin("system")
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnedKind {
    CollectionItem,
    UsageLog,
    MaintenanceLog,
    Container,
    FollowEdge,
    Comment,
    Subscription,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnerKey {
    Id,
    Email,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnerField {
    pub column: &'static str,
    pub key: OwnerKey,
}

const fn by_id(column: &'static str) -> OwnerField {
    OwnerField {
        column,
        key: OwnerKey::Id,
    }
}

const fn by_email(column: &'static str) -> OwnerField {
    OwnerField {
        column,
        key: OwnerKey::Email,
    }
}

impl OwnedKind {
    pub const ALL: [OwnedKind; 7] = [
        OwnedKind::CollectionItem,
        OwnedKind::UsageLog,
        OwnedKind::MaintenanceLog,
        OwnedKind::Container,
        OwnedKind::FollowEdge,
        OwnedKind::Comment,
        OwnedKind::Subscription,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            OwnedKind::CollectionItem => "CollectionItem",
            OwnedKind::UsageLog => "UsageLog",
            OwnedKind::MaintenanceLog => "MaintenanceLog",
            OwnedKind::Container => "Container",
            OwnedKind::FollowEdge => "Follow",
            OwnedKind::Comment => "Comment",
            OwnedKind::Subscription => "Subscription",
        }
    }

    pub fn owner_fields(&self) -> &'static [OwnerField] {
        const COLLECTION: [OwnerField; 1] = [by_id("userId")];
        const CONTAINER: [OwnerField; 1] = [by_email("ownerEmail")];
        const FOLLOW: [OwnerField; 2] = [by_id("followerId"), by_id("followingId")];
        const COMMENT: [OwnerField; 2] = [by_id("authorId"), by_email("authorEmail")];
        const SUBSCRIPTION: [OwnerField; 2] = [by_id("identityId"), by_email("ownerEmail")];

        match self {
            OwnedKind::CollectionItem | OwnedKind::UsageLog | OwnedKind::MaintenanceLog => {
                &COLLECTION
            }
            OwnedKind::Container => &CONTAINER,
            OwnedKind::FollowEdge => &FOLLOW,
            OwnedKind::Comment => &COMMENT,
            OwnedKind::Subscription => &SUBSCRIPTION,
        }
    }
}

/// One owner reference held by a record, as found in the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedRecordRef {
    pub kind: OwnedKind,
    pub record_id: String,
    pub column: &'static str,
    pub value: String,
}

/// Rewrite of one owner reference from a duplicate to the canonical identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedRecordMove {
    pub kind: OwnedKind,
    pub record_id: String,
    pub column: String,
    pub from: String,
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_normalization_tolerates_noise() {
        assert_eq!(Tier::normalize("Pro "), Tier::Pro);
        assert_eq!(Tier::normalize(" PREMIUM"), Tier::Premium);
        assert_eq!(Tier::normalize("pr0"), Tier::Free);
        assert_eq!(Tier::normalize(""), Tier::Free);
    }

    #[test]
    fn test_subscription_status_normalization() {
        assert_eq!(SubscriptionStatus::normalize("Past-Due"), SubscriptionStatus::PastDue);
        assert_eq!(SubscriptionStatus::normalize("cancelled"), SubscriptionStatus::Canceled);
        assert_eq!(SubscriptionStatus::normalize("incomplete_expired"), SubscriptionStatus::Expired);
        assert_eq!(SubscriptionStatus::normalize("???"), SubscriptionStatus::Expired);
    }

    #[test]
    fn test_provider_normalization() {
        assert_eq!(Provider::normalize("web-processor"), Some(Provider::Stripe));
        assert_eq!(Provider::normalize("Mobile Store"), Some(Provider::AppStore));
        assert_eq!(Provider::normalize("none"), None);
        assert_eq!(provider_label(None), "none");
    }

    #[test]
    fn test_level_follows_tier() {
        assert_eq!(Level::from_tier(Tier::Free), Level::Free);
        assert_eq!(Level::from_tier(Tier::Premium), Level::Paid);
        assert_eq!(Level::from_tier(Tier::Pro), Level::Paid);
    }

    #[test]
    fn test_follow_edges_have_two_owner_columns() {
        let columns: Vec<_> = OwnedKind::FollowEdge
            .owner_fields()
            .iter()
            .map(|f| f.column)
            .collect();
        assert_eq!(columns, vec!["followerId", "followingId"]);
    }
}
