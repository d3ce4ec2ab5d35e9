//! Database adapters (connection pool wiring).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::{parse_var, ConfigError};

/// Postgres connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    /// Read `DATABASE_URL` and `DB_MAX_CONNECTIONS`. Returns `None` when no
    /// database is configured.
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(url) = lookup("DATABASE_URL").filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let mut config = Self::new(url);
        config.max_connections = parse_var(&lookup, "DB_MAX_CONNECTIONS", config.max_connections)?;
        if config.max_connections == 0 {
            return Err(ConfigError::Constraint(
                "DB_MAX_CONNECTIONS must be at least 1".into(),
            ));
        }
        Ok(Some(config))
    }

    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.url)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_url_means_no_database() {
        assert_eq!(DatabaseConfig::from_lookup(|_| None).unwrap(), None);
        assert_eq!(
            DatabaseConfig::from_lookup(|_| Some("  ".to_string())).unwrap(),
            None
        );
    }

    #[test]
    fn reads_pool_size() {
        let config = DatabaseConfig::from_lookup(|key| match key {
            "DATABASE_URL" => Some("postgres://localhost/jobs".to_string()),
            "DB_MAX_CONNECTIONS" => Some("3".to_string()),
            _ => None,
        })
        .unwrap()
        .unwrap();
        assert_eq!(config.url, "postgres://localhost/jobs");
        assert_eq!(config.max_connections, 3);
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let err = DatabaseConfig::from_lookup(|key| match key {
            "DATABASE_URL" => Some("postgres://localhost/jobs".to_string()),
            "DB_MAX_CONNECTIONS" => Some("0".to_string()),
            _ => None,
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Constraint(_)));
    }
}
