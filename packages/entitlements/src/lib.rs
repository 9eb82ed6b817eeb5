//! Entitlement reconciliation core.
//!
//! Keeps one person's paid access consistent across duplicate accounts and
//! several billing providers: merge duplicates into a canonical identity,
//! aggregate every subscription it owns, resolve the effective tier by
//! precedence, and write the result through a guarded writer. Drift
//! detection reports disagreements without fixing them.

pub mod aggregate;
pub mod config;
pub mod document;
pub mod drift;
pub mod entity;
pub mod error;
pub mod guard;
pub mod identity;
pub mod ingest;
pub mod model;
pub mod precedence;
pub mod provider;
pub mod service;
pub mod store;
pub mod writer;

pub use config::{ProviderFallback, ReconcileConfig, ScoringWeights};
pub use error::{ErrorKind, ReconcileError, Result};
pub use ingest::SubscriptionEvent;
pub use model::{Actor, EntitlementStatus, Identity, Provider, Subscription, Tier};
pub use service::{
    BatchItem, BatchOptions, BatchResult, Clock, DriftScan, EntitlementCheck, FixedClock,
    IngestResult, MergeAllOptions, ReconcileOptions, ReconcileResult, ReconcileService,
    SystemClock,
};
pub use store::{EntitlementStore, MemoryStore, SeaOrmStore, create_store};

pub use sea_orm;
