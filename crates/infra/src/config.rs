//! Configuration loading and representation.
//!
//! Values come from environment variables. Lookups go through a closure so
//! tests can feed a map instead of mutating the process environment.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Constraint(String),
}

/// Parse an optional variable, falling back to `default` when unset or blank.
pub fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

/// Order in which queued jobs are handed to workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOrder {
    /// Highest priority first, arrival order within a priority.
    #[default]
    Priority,
    /// Strict arrival order; priority is stored but ignored.
    Fifo,
}

impl FromStr for DispatchOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "priority" => Ok(DispatchOrder::Priority),
            "fifo" => Ok(DispatchOrder::Fifo),
            other => Err(format!("expected 'priority' or 'fifo', got '{other}'")),
        }
    }
}

/// Job engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// Capacity of the in-memory dispatch queue
    pub queue_capacity: usize,
    /// Capacity of the worker → result processor channel
    pub result_buffer: usize,
    /// How often pending jobs are re-loaded from the store (None = start-up only)
    pub recovery_interval: Option<Duration>,
    /// Page size used when scanning the store for pending jobs
    pub recovery_page_size: usize,
    /// How long `stop` waits for in-flight handlers before abandoning them
    pub shutdown_timeout: Duration,
    pub dispatch_order: DispatchOrder,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1000,
            result_buffer: 100,
            recovery_interval: Some(Duration::from_secs(30)),
            recovery_page_size: 500,
            shutdown_timeout: Duration::from_secs(30),
            dispatch_order: DispatchOrder::Priority,
        }
    }
}

impl EngineConfig {
    /// Load from `JOB_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let recovery_secs = parse_var(
            &lookup,
            "JOB_RECOVERY_INTERVAL_SECS",
            defaults.recovery_interval.map_or(0, |d| d.as_secs()),
        )?;

        let config = Self {
            workers: parse_var(&lookup, "JOB_WORKERS", defaults.workers)?,
            queue_capacity: parse_var(&lookup, "JOB_QUEUE_CAPACITY", defaults.queue_capacity)?,
            result_buffer: parse_var(&lookup, "JOB_RESULT_BUFFER", defaults.result_buffer)?,
            recovery_interval: (recovery_secs > 0).then(|| Duration::from_secs(recovery_secs)),
            recovery_page_size: parse_var(
                &lookup,
                "JOB_RECOVERY_PAGE_SIZE",
                defaults.recovery_page_size,
            )?,
            shutdown_timeout: Duration::from_secs(parse_var(
                &lookup,
                "JOB_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout.as_secs(),
            )?),
            dispatch_order: parse_var(&lookup, "JOB_DISPATCH_ORDER", defaults.dispatch_order)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Constraint("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Constraint(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.result_buffer == 0 {
            return Err(ConfigError::Constraint(
                "result_buffer must be at least 1".into(),
            ));
        }
        if self.recovery_page_size == 0 {
            return Err(ConfigError::Constraint(
                "recovery_page_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_result_buffer(mut self, capacity: usize) -> Self {
        self.result_buffer = capacity;
        self
    }

    pub fn with_recovery_interval(mut self, interval: Option<Duration>) -> Self {
        self.recovery_interval = interval;
        self
    }

    pub fn with_recovery_page_size(mut self, page_size: usize) -> Self {
        self.recovery_page_size = page_size;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_dispatch_order(mut self, order: DispatchOrder) -> Self {
        self.dispatch_order = order;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_source_queue_sizes() {
        let config = EngineConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.workers, 4);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.result_buffer, 100);
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("JOB_WORKERS", "8"),
            ("JOB_QUEUE_CAPACITY", "50"),
            ("JOB_RECOVERY_INTERVAL_SECS", "0"),
            ("JOB_SHUTDOWN_TIMEOUT_SECS", "5"),
            ("JOB_DISPATCH_ORDER", "FIFO"),
        ]))
        .unwrap();

        assert_eq!(config.workers, 8);
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.recovery_interval, None);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.dispatch_order, DispatchOrder::Fifo);
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = EngineConfig::from_lookup(lookup_from(&[("JOB_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "JOB_WORKERS"));

        let err =
            EngineConfig::from_lookup(lookup_from(&[("JOB_DISPATCH_ORDER", "random")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = EngineConfig::from_lookup(lookup_from(&[("JOB_WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Constraint(_)));
        assert!(EngineConfig::default().with_queue_capacity(0).validate().is_err());
    }
}
