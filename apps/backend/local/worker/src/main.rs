#[cfg(not(any(all(target_os = "macos", target_arch = "aarch64"), target_os = "ios")))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use dotenv::dotenv;
use entitlement_core::provider::{ClientCache, StripeConfig, StripeLookup};
use entitlement_core::{
    Actor, BatchOptions, EntitlementStore, MergeAllOptions, ReconcileConfig, ReconcileService,
    create_store,
};
use sea_orm::Database;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting entitlement worker");

    let config = config::Config::from_env()?;
    tracing::info!(
        "Loaded configuration: interval={}s, dedup={}, batch={}, dry_run={}",
        config.interval.as_secs(),
        config.dedup_sweep_enabled,
        config.batch_enabled,
        config.dry_run
    );

    let db = match &config.database_url {
        Some(url) => Some(Arc::new(Database::connect(url).await?)),
        None => None,
    };
    let store = create_store(db).await?;
    tracing::info!(backend = store.backend_name(), "Entitlement store ready");

    let reconcile_config = ReconcileConfig::from_env();
    let mut service = ReconcileService::new(store, reconcile_config.clone());
    match StripeConfig::from_env() {
        Some(stripe) => {
            let clients = Arc::new(ClientCache::new(reconcile_config.client_cache_ttl));
            service = service.with_live_lookup(Arc::new(StripeLookup::new(stripe, clients)));
            tracing::info!("Live Stripe lookups enabled");
        }
        None => tracing::warn!("STRIPE_SECRET_KEY not set, live lookups disabled"),
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing in-flight work");
            shutdown.cancel();
        }
    });

    loop {
        run_cycle(&service, &config, &cancel).await;
        if config.run_once || cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }

    tracing::info!("Entitlement worker stopped");
    Ok(())
}

/// One dedup sweep, batch repair and drift scan. Failures are logged and
/// retried next cycle.
async fn run_cycle(service: &ReconcileService, config: &config::Config, cancel: &CancellationToken) {
    let actor = Actor::system();

    if config.dedup_sweep_enabled {
        let options = MergeAllOptions {
            dry_run: config.dry_run,
            limit: None,
        };
        match service.merge_all_duplicates(&actor, options, cancel).await {
            Ok(sweep) => tracing::info!(
                groups = sweep.processed,
                merged = sweep.changed,
                failed = sweep.failed,
                "Dedup sweep done"
            ),
            Err(e) => tracing::error!(error = %e, "Dedup sweep failed"),
        }
    }

    if config.batch_enabled && !cancel.is_cancelled() {
        let options = BatchOptions {
            dry_run: config.dry_run,
            limit: config.batch_limit,
            tier_filter: None,
        };
        match service.reconcile_batch(&actor, options, cancel).await {
            Ok(batch) => {
                for item in &batch.results {
                    if let Some(error) = item.error() {
                        tracing::warn!(identity_id = %item.key(), error = %error, "Reconcile failed");
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Batch reconcile failed"),
        }
    }

    if !cancel.is_cancelled() {
        match service.scan_drift(&actor).await {
            Ok(scan) => tracing::info!(
                scanned = scan.scanned,
                findings = scan.records.len(),
                "Drift scan done"
            ),
            Err(e) => tracing::error!(error = %e, "Drift scan failed"),
        }
    }
}
