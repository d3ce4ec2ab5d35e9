use std::sync::Arc;

use anyhow::Context as _;
use tracing::{info, warn};

use coursegen_infra::jobs::{register_default_handlers, InMemoryJobStore, JobEngine, JobStore, PostgresJobStore};
use coursegen_worker::{AppConfig, SimulatedPipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    coursegen_observability::init_with(config.log_format);

    let store: Arc<dyn JobStore> = match &config.database {
        Some(db) => {
            let pool = db.connect().await.context("failed to connect to Postgres")?;
            let store = PostgresJobStore::new(pool);
            store.ensure_schema().await.context("failed to prepare jobs schema")?;
            info!(max_connections = db.max_connections, "using Postgres job store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; jobs are kept in memory and lost on exit");
            InMemoryJobStore::arc()
        }
    };

    let engine = JobEngine::new(store, config.engine.clone())?;
    register_default_handlers(
        engine.registry(),
        Arc::new(SimulatedPipeline::new(config.stage_delay)),
    )?;
    engine.start().await?;

    let kinds: Vec<String> = engine
        .registered_kinds()
        .iter()
        .map(ToString::to_string)
        .collect();
    info!(
        workers = config.engine.workers,
        queue_capacity = config.engine.queue_capacity,
        ?kinds,
        "job worker running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    let report = engine.stop().await?;
    let stats = engine.stats();
    if report.graceful {
        info!(jobs_processed = stats.jobs_processed, "job worker stopped");
    } else {
        warn!(
            abandoned = report.abandoned.len(),
            jobs_processed = stats.jobs_processed,
            "shutdown timeout elapsed; running jobs were abandoned"
        );
    }
    Ok(())
}
