//! Process configuration for the worker binary.

use std::time::Duration;

use coursegen_infra::config::{parse_var, ConfigError};
use coursegen_infra::{DatabaseConfig, EngineConfig};
use coursegen_observability::LogFormat;

/// Everything the worker needs at start-up.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// `None` keeps jobs in memory.
    pub database: Option<DatabaseConfig>,
    pub log_format: LogFormat,
    pub engine: EngineConfig,
    /// Simulated time spent in each media stage.
    pub stage_delay: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: None,
            log_format: LogFormat::default(),
            engine: EngineConfig::default(),
            stage_delay: Duration::from_millis(500),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    ///
    /// Reads `LOG_FORMAT`, `STAGE_DELAY_MS`, the `DATABASE_URL` family and the
    /// `JOB_*` engine settings.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let stage_delay_ms = parse_var(
            &lookup,
            "STAGE_DELAY_MS",
            defaults.stage_delay.as_millis() as u64,
        )?;

        Ok(Self {
            database: DatabaseConfig::from_lookup(&lookup)?,
            log_format: parse_var(&lookup, "LOG_FORMAT", defaults.log_format)?,
            engine: EngineConfig::from_lookup(&lookup)?,
            stage_delay: Duration::from_millis(stage_delay_ms),
        })
    }
}
