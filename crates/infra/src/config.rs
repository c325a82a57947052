//! Configuration loading and representation.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::reservations::ResolvePolicy;

pub const ENV_DEFAULT_MILLICORES: &str = "JOBRESERVE_DEFAULT_MILLICORES";
pub const ENV_RESOLVE_MAX_ATTEMPTS: &str = "JOBRESERVE_RESOLVE_MAX_ATTEMPTS";
pub const ENV_RESOLVE_INTERVAL_MS: &str = "JOBRESERVE_RESOLVE_INTERVAL_MS";
pub const ENV_MAX_DB_CONNECTIONS: &str = "JOBRESERVE_MAX_DB_CONNECTIONS";
pub const ENV_LOG_LEVEL: &str = "JOBRESERVE_LOG_LEVEL";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

/// Settings for the reservation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationConfig {
    /// Millicores reserved for a step that declares no core limit.
    pub default_millicores: f64,
    /// Lookups attempted before a job id is declared unresolvable.
    pub resolve_max_attempts: u32,
    /// Pause between lookups while the job row does not exist yet.
    pub resolve_interval: Duration,
    /// Postgres connection string; required only when connecting a pool.
    pub database_url: Option<String>,
    pub max_db_connections: u32,
    /// Default tracing directive, overridden by `RUST_LOG`.
    pub log_level: String,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            default_millicores: 4000.0,
            resolve_max_attempts: 30,
            resolve_interval: Duration::from_secs(2),
            database_url: None,
            max_db_connections: 10,
            log_level: "info".to_string(),
        }
    }
}

impl ReservationConfig {
    /// Read settings from the process environment, keeping defaults for unset variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_DEFAULT_MILLICORES) {
            config.default_millicores = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_DEFAULT_MILLICORES} must be a number, got {raw:?}"))?;
        }
        if let Some(raw) = lookup(ENV_RESOLVE_MAX_ATTEMPTS) {
            config.resolve_max_attempts = raw.trim().parse().with_context(|| {
                format!("{ENV_RESOLVE_MAX_ATTEMPTS} must be a non-negative integer, got {raw:?}")
            })?;
        }
        if let Some(raw) = lookup(ENV_RESOLVE_INTERVAL_MS) {
            let millis: u64 = raw.trim().parse().with_context(|| {
                format!("{ENV_RESOLVE_INTERVAL_MS} must be milliseconds, got {raw:?}")
            })?;
            config.resolve_interval = Duration::from_millis(millis);
        }
        if let Some(raw) = lookup(ENV_MAX_DB_CONNECTIONS) {
            config.max_db_connections = raw.trim().parse().with_context(|| {
                format!("{ENV_MAX_DB_CONNECTIONS} must be a positive integer, got {raw:?}")
            })?;
        }
        if let Some(raw) = lookup(ENV_LOG_LEVEL) {
            config.log_level = raw;
        }
        config.database_url = lookup(ENV_DATABASE_URL).filter(|url| !url.is_empty());

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.default_millicores.is_finite() && self.default_millicores >= 0.0,
            "default millicores must be a non-negative number, got {}",
            self.default_millicores
        );
        anyhow::ensure!(
            self.resolve_max_attempts > 0,
            "resolve attempts must be at least 1"
        );
        anyhow::ensure!(
            self.max_db_connections > 0,
            "max db connections must be at least 1"
        );
        Ok(())
    }

    pub fn with_default_millicores(mut self, millicores: f64) -> Self {
        self.default_millicores = millicores;
        self
    }

    pub fn with_resolve_policy(mut self, max_attempts: u32, interval: Duration) -> Self {
        self.resolve_max_attempts = max_attempts;
        self.resolve_interval = interval;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn resolve_policy(&self) -> ResolvePolicy {
        ResolvePolicy::new(self.resolve_max_attempts, self.resolve_interval)
    }
}
