use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// Required unless the memory store backend is selected
    pub database_url: Option<String>,
    /// Pause between two cycles
    pub interval: Duration,
    /// Run a single cycle and exit
    pub run_once: bool,
    /// Merge every duplicate email group before reconciling
    pub dedup_sweep_enabled: bool,
    /// Reconcile every identity each cycle
    pub batch_enabled: bool,
    pub batch_limit: Option<usize>,
    pub dry_run: bool,
}

fn flag(key: &str) -> bool {
    env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            database_url: env::var("DATABASE_URL").ok(),
            interval: Duration::from_secs(
                env::var("WORKER_INTERVAL_SECS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("WORKER_INTERVAL_SECS".to_string()))?,
            ),
            run_once: flag("WORKER_RUN_ONCE"),
            dedup_sweep_enabled: flag("DEDUP_SWEEP_ENABLED"),
            batch_enabled: flag("RECONCILE_BATCH_ENABLED"),
            batch_limit: match env::var("RECONCILE_BATCH_LIMIT") {
                Ok(raw) => Some(
                    raw.parse()
                        .map_err(|_| ConfigError::InvalidValue("RECONCILE_BATCH_LIMIT".to_string()))?,
                ),
                Err(_) => None,
            },
            dry_run: flag("RECONCILE_DRY_RUN"),
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(var) => write!(f, "Invalid value for: {}", var),
        }
    }
}

impl std::error::Error for ConfigError {}
