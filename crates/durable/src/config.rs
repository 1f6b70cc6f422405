//! Orchestrator configuration
//!
//! Built in code or read from environment variables:
//! - `DURABLE_DATABASE_URL`: SQLite URL (default: `sqlite://tallyloom.db`)
//! - `DURABLE_MAX_WORKERS`: number of worker tasks (default: 4)
//! - `DURABLE_SHUTDOWN_TIMEOUT_MS`: drain deadline for `stop` (default: 30000)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::worker::WorkerPoolConfig;

/// Default database location when none is configured
pub const DEFAULT_DATABASE_URL: &str = "sqlite://tallyloom.db";

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// SQLite database URL
    pub database_url: String,

    /// Worker pool settings
    #[serde(default)]
    pub pool: WorkerPoolConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            pool: WorkerPoolConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Create a configuration for the given database URL
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Unset variables use defaults. Unparseable values are logged and
    /// replaced by defaults.
    pub fn from_env() -> Self {
        let defaults = WorkerPoolConfig::default();

        let database_url = std::env::var("DURABLE_DATABASE_URL")
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let max_workers = parse_env("DURABLE_MAX_WORKERS").unwrap_or(defaults.max_workers);

        let shutdown_timeout = parse_env("DURABLE_SHUTDOWN_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_timeout);

        Self {
            database_url,
            pool: WorkerPoolConfig::default()
                .with_max_workers(max_workers)
                .with_shutdown_timeout(shutdown_timeout),
        }
    }

    /// Set the database URL
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Set the number of worker tasks
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.pool = self.pool.with_max_workers(max_workers);
        self
    }

    /// Set the drain deadline used by `stop`
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.pool = self.pool.with_shutdown_timeout(timeout);
        self
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
