//! Job worker process: configuration and the content pipeline the default
//! handlers drive.

pub mod config;
pub mod pipeline;

pub use config::AppConfig;
pub use pipeline::SimulatedPipeline;
