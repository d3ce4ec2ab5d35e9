//! Infrastructure layer: configuration, database wiring and the job engine.

pub mod config;
pub mod db;
pub mod jobs;

pub use config::{ConfigError, DispatchOrder, EngineConfig};
pub use db::DatabaseConfig;
