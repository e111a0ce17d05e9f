//! Run configuration
//!
//! Loaded once at startup from the environment (a `.env` file is honoured)
//! with [`IngestConfig::load_env`], then optionally overridden from CLI flags
//! and checked once with [`IngestConfig::validate`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{IngestError, Result};

// ============================================================================
// Defaults
// ============================================================================

/// Lines per batch.
pub const DEFAULT_BATCH_SIZE: u64 = 50_000;

/// How long a run waits for every batch to signal.
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 15 * 60;

/// Wall-clock cap on a whole run, planning included.
pub const DEFAULT_MAX_RUN_DURATION_SECS: u64 = 120 * 60;

/// Records per destination write transaction.
pub const DEFAULT_STORE_BATCH_SIZE: usize = 25;

/// Rows between worker progress log lines.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 1_000;

/// Destination table for the Postgres store.
pub const DEFAULT_TARGET_TABLE: &str = "estimates";

/// Settings that shape a run: batch planning, waiting, and dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestConfig {
    /// Lines per batch (must be > 0)
    pub batch_size: u64,
    /// Max wait for all completion signals
    pub run_timeout: Duration,
    /// Max duration of a run from planning to terminal status
    pub max_run_duration: Duration,
    /// Optional ceiling on concurrently running batch workers
    pub max_concurrency: Option<usize>,
    /// Records per store write
    pub store_batch_size: usize,
    /// Rows between progress log lines
    pub progress_interval: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            run_timeout: Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
            max_run_duration: Duration::from_secs(DEFAULT_MAX_RUN_DURATION_SECS),
            max_concurrency: None,
            store_batch_size: DEFAULT_STORE_BATCH_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl IngestConfig {
    /// Load from `FANLOAD_*` environment variables and validate
    pub fn from_env() -> Result<Self> {
        let config = Self::load_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `FANLOAD_*` environment variables without validating, so
    /// overrides can be applied before a single [`IngestConfig::validate`]
    pub fn load_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from a variable lookup; unset keys keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            batch_size: parse_var(&lookup, "FANLOAD_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            run_timeout: parse_var(&lookup, "FANLOAD_RUN_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.run_timeout),
            max_run_duration: parse_var(&lookup, "FANLOAD_MAX_RUN_DURATION_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_run_duration),
            max_concurrency: parse_var(&lookup, "FANLOAD_MAX_CONCURRENCY")?,
            store_batch_size: parse_var(&lookup, "FANLOAD_STORE_BATCH_SIZE")?
                .unwrap_or(defaults.store_batch_size),
            progress_interval: parse_var(&lookup, "FANLOAD_PROGRESS_INTERVAL")?
                .unwrap_or(defaults.progress_interval),
        })
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_max_run_duration(mut self, duration: Duration) -> Self {
        self.max_run_duration = duration;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: Option<usize>) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_store_batch_size(mut self, store_batch_size: usize) -> Self {
        self.store_batch_size = store_batch_size;
        self
    }

    /// Reject settings that would make a run meaningless
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IngestError::InvalidConfiguration(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.store_batch_size == 0 {
            return Err(IngestError::InvalidConfiguration(
                "store_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.run_timeout.is_zero() || self.max_run_duration.is_zero() {
            return Err(IngestError::InvalidConfiguration(
                "run_timeout and max_run_duration must be non-zero".to_string(),
            ));
        }

        if self.run_timeout > self.max_run_duration {
            return Err(IngestError::InvalidConfiguration(format!(
                "run_timeout ({:?}) cannot exceed max_run_duration ({:?})",
                self.run_timeout, self.max_run_duration
            )));
        }

        if self.max_concurrency == Some(0) {
            return Err(IngestError::InvalidConfiguration(
                "max_concurrency must be greater than 0 when set".to_string(),
            ));
        }

        if self.progress_interval == 0 {
            return Err(IngestError::InvalidConfiguration(
                "progress_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Postgres destination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub target_table: String,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let url = std::env::var("DATABASE_URL").map_err(|_| {
            IngestError::InvalidConfiguration("DATABASE_URL must be set for the postgres store".to_string())
        })?;
        let target_table =
            std::env::var("FANLOAD_TARGET_TABLE").unwrap_or_else(|_| DEFAULT_TARGET_TABLE.to_string());

        if !is_plain_identifier(&target_table) {
            return Err(IngestError::InvalidConfiguration(format!(
                "FANLOAD_TARGET_TABLE {target_table:?} is not a plain SQL identifier"
            )));
        }

        Ok(Self {
            url,
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS")?.unwrap_or(10),
            target_table,
        })
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`; the table name is interpolated into SQL
pub(crate) fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    parse_var(&|name: &str| std::env::var(name).ok(), name)
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            IngestError::InvalidConfiguration(format!("{name}={raw:?} is not valid: {e}"))
        }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::default();
        assert_eq!(config.batch_size, 50_000);
        assert_eq!(config.max_concurrency, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_is_invalid() {
        let config = IngestConfig::default().with_batch_size(0);
        assert!(matches!(config.validate(), Err(IngestError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_zero_concurrency_is_invalid() {
        let config = IngestConfig::default().with_max_concurrency(Some(0));
        assert!(matches!(config.validate(), Err(IngestError::InvalidConfiguration(_))));

        let config = IngestConfig::default().with_max_concurrency(Some(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_timeout_cannot_exceed_run_duration() {
        let config = IngestConfig::default()
            .with_run_timeout(Duration::from_secs(60))
            .with_max_run_duration(Duration::from_secs(30));
        assert!(matches!(config.validate(), Err(IngestError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_zero_store_batch_is_invalid() {
        let config = IngestConfig::default().with_store_batch_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_apply_before_validation() {
        let vars = [("FANLOAD_BATCH_SIZE", "0"), ("FANLOAD_MAX_CONCURRENCY", " 8 ")];
        let lookup = |name: &str| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        };

        let loaded = IngestConfig::from_lookup(lookup).unwrap();
        assert_eq!(loaded.batch_size, 0);
        assert_eq!(loaded.max_concurrency, Some(8));
        assert!(loaded.validate().is_err());

        let overridden = loaded.with_batch_size(1_000);
        assert!(overridden.validate().is_ok());
    }

    #[test]
    fn test_unparseable_variable_is_invalid() {
        let result = IngestConfig::from_lookup(|name: &str| {
            (name == "FANLOAD_RUN_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(IngestError::InvalidConfiguration(_))));

        let defaults = IngestConfig::from_lookup(|_: &str| None).unwrap();
        assert_eq!(defaults, IngestConfig::default());
    }

    #[test]
    fn test_plain_identifier() {
        assert!(is_plain_identifier("estimates"));
        assert!(is_plain_identifier("_estimates_v2"));
        assert!(!is_plain_identifier("2estimates"));
        assert!(!is_plain_identifier("estimates; drop table x"));
        assert!(!is_plain_identifier(""));
    }
}
