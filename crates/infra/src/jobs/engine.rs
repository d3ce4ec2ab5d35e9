//! Job queue engine: admission, lifecycle transitions, cancellation,
//! recovery and shutdown.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use coursegen_core::{CourseId, UserId};

use crate::config::EngineConfig;

use super::dispatch::{DispatchQueue, PushError};
use super::error::EngineError;
use super::inflight::InFlight;
use super::registry::{HandlerRegistry, JobHandler};
use super::stats::{EngineStats, EngineStatsSnapshot};
use super::store::{JobFilter, JobPage, JobStore, JobStoreError, JobUpdate};
use super::types::{Job, JobId, JobKind, JobStatus, JsonMap, Priority};
use super::worker::{
    recover_pending, run_recovery_loop, run_result_processor, run_worker, RecoveryReport,
};

/// Error recorded on jobs still running when the shutdown timeout expires.
pub const ABANDONED_ON_SHUTDOWN: &str = "abandoned: shutdown timeout elapsed";

/// State shared by the engine handle, the workers and every [`JobContext`](super::JobContext).
pub(crate) struct EngineShared {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) queue: DispatchQueue,
    pub(crate) in_flight: Arc<InFlight>,
    pub(crate) stats: EngineStats,
    pub(crate) config: EngineConfig,
}

impl EngineShared {
    pub(crate) async fn update_progress(&self, id: JobId, progress: i64) -> Result<Job, EngineError> {
        let progress = u8::try_from(progress)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| {
                EngineError::validation(format!("progress must be between 0 and 100, got {progress}"))
            })?;

        let update = JobUpdate::new()
            .progress(progress)
            .expect_status(&[JobStatus::Pending, JobStatus::Running]);
        Ok(self.store.update(id, update).await?)
    }

    pub(crate) async fn update_result(&self, id: JobId, result: JsonMap) -> Result<Job, EngineError> {
        let update = JobUpdate::new()
            .result(result)
            .expect_status(&[JobStatus::Running])
            .expect_no_result();
        Ok(self.store.update(id, update).await?)
    }

    pub(crate) async fn set_course(&self, id: JobId, course_id: CourseId) -> Result<Job, EngineError> {
        Ok(self
            .store
            .update(id, JobUpdate::new().course_id(course_id))
            .await?)
    }
}

/// Outcome of [`JobEngine::stop`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ShutdownReport {
    /// Every task exited before the shutdown timeout.
    pub graceful: bool,
    /// Jobs that were still executing when the timeout expired.
    pub abandoned: Vec<JobId>,
}

struct RunState {
    root: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    recovery: Option<JoinHandle<()>>,
    result_processor: JoinHandle<()>,
}

/// Asynchronous job engine.
///
/// Persists jobs through a [`JobStore`], dispatches them to a fixed pool of
/// workers and finalises their state once the handler returns.
pub struct JobEngine {
    shared: Arc<EngineShared>,
    run: Mutex<Option<RunState>>,
}

impl JobEngine {
    pub fn new(store: Arc<dyn JobStore>, config: EngineConfig) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::validation(e.to_string()))?;

        let shared = EngineShared {
            store,
            registry: HandlerRegistry::new(),
            queue: DispatchQueue::new(config.queue_capacity, config.dispatch_order),
            in_flight: Arc::new(InFlight::new()),
            stats: EngineStats::new(),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
            run: Mutex::new(None),
        })
    }

    fn run_state(&self) -> MutexGuard<'_, Option<RunState>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }

    /// Register a handler for a job kind, replacing any previous one.
    pub fn register_handler<H: JobHandler>(&self, kind: JobKind, handler: H) -> Result<(), EngineError> {
        self.shared.registry.register(kind, Arc::new(handler))
    }

    /// Kinds that currently have a handler.
    pub fn registered_kinds(&self) -> Vec<JobKind> {
        self.shared.registry.kinds()
    }

    pub fn is_running(&self) -> bool {
        self.run_state().is_some()
    }

    /// Spawn the workers, the result processor and the periodic recovery loop,
    /// then queue the pending jobs found in the store.
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let mut run = self.run_state();
            if run.is_some() {
                return Err(EngineError::AlreadyRunning);
            }

            let config = &self.shared.config;
            let root = CancellationToken::new();
            let (outcomes_tx, outcomes_rx) = mpsc::channel(config.result_buffer);

            let workers = (0..config.workers)
                .map(|n| {
                    tokio::spawn(run_worker(
                        n,
                        Arc::clone(&self.shared),
                        root.clone(),
                        outcomes_tx.clone(),
                    ))
                })
                .collect();
            // The processor exits once the last worker drops its sender.
            drop(outcomes_tx);
            let result_processor =
                tokio::spawn(run_result_processor(Arc::clone(&self.shared), outcomes_rx));
            let recovery = config.recovery_interval.map(|period| {
                tokio::spawn(run_recovery_loop(
                    Arc::clone(&self.shared),
                    root.clone(),
                    period,
                ))
            });

            *run = Some(RunState {
                root,
                workers,
                recovery,
                result_processor,
            });
        }

        info!(
            workers = self.shared.config.workers,
            queue_capacity = self.shared.config.queue_capacity,
            order = ?self.shared.config.dispatch_order,
            "job engine started"
        );

        match recover_pending(&self.shared).await {
            Ok(report) => info!(
                queued = report.queued,
                skipped = report.skipped,
                queue_full = report.queue_full,
                "loaded pending jobs"
            ),
            Err(e) => error!(error = %e, "failed to load pending jobs"),
        }
        Ok(())
    }

    /// Cancel the engine's root token and wait for every task to exit, up to
    /// the configured shutdown timeout. Jobs still running after that are
    /// aborted and marked failed.
    pub async fn stop(&self) -> Result<ShutdownReport, EngineError> {
        let run = self.run_state().take().ok_or(EngineError::NotRunning)?;
        info!("stopping job engine");
        run.root.cancel();

        let deadline = Instant::now() + self.shared.config.shutdown_timeout;
        let mut tasks = run.workers;
        tasks.extend(run.recovery);
        tasks.push(run.result_processor);

        let mut graceful = true;
        for task in tasks.iter_mut() {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                graceful = false;
                break;
            }
        }

        if graceful {
            info!("job engine stopped");
            return Ok(ShutdownReport {
                graceful,
                abandoned: Vec::new(),
            });
        }

        let abandoned = self.shared.in_flight.abandon_all();
        for task in &tasks {
            task.abort();
        }
        warn!(
            abandoned = abandoned.len(),
            timeout_secs = self.shared.config.shutdown_timeout.as_secs(),
            "shutdown timeout elapsed, abandoning running jobs"
        );

        for id in &abandoned {
            let update = JobUpdate::new()
                .status(JobStatus::Failed)
                .error(ABANDONED_ON_SHUTDOWN)
                .clear_result()
                .completed_at(Utc::now())
                .expect_status(&[JobStatus::Running]);
            match self.shared.store.update(*id, update).await {
                Ok(_) | Err(JobStoreError::StatusMismatch { .. }) => {}
                Err(e) => error!(job_id = %id, error = %e, "failed to mark abandoned job"),
            }
        }

        Ok(ShutdownReport {
            graceful,
            abandoned,
        })
    }

    /// Persist a new pending job and try to queue it for dispatch.
    ///
    /// `QueueFull` means the job was stored but not queued; it stays pending
    /// until a recovery pass schedules it.
    #[instrument(skip_all, fields(kind = %kind, user_id = %user_id, priority = ?priority), err)]
    pub async fn enqueue(
        &self,
        kind: JobKind,
        user_id: UserId,
        payload: JsonMap,
        priority: Priority,
    ) -> Result<Job, EngineError> {
        kind.validate()?;
        let job = Job::new(kind, user_id, payload, priority);
        self.shared.store.create(&job).await?;

        match self.shared.queue.try_push(job.clone()) {
            Ok(()) | Err(PushError::Duplicate(_)) => {
                info!(job_id = %job.id, "job enqueued");
                Ok(job)
            }
            Err(PushError::Full(job_id)) => {
                warn!(%job_id, "job queue is full, job left pending");
                Err(EngineError::QueueFull { job_id })
            }
        }
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job, EngineError> {
        Ok(self.shared.store.get(id).await?)
    }

    /// A user's jobs, newest first.
    pub async fn get_user_jobs(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, EngineError> {
        let filter = JobFilter::new().with_user(user_id.clone());
        Ok(self.shared.store.list(&filter, limit, offset).await?.jobs)
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<JobPage, EngineError> {
        Ok(self.shared.store.list(filter, limit, offset).await?)
    }

    /// Cancel a pending or running job.
    ///
    /// A queued job is dropped from the dispatch queue; a running job has its
    /// cancellation token fired and keeps the `cancelled` status whatever its
    /// handler returns.
    #[instrument(skip(self), err)]
    pub async fn cancel_job(&self, id: JobId) -> Result<Job, EngineError> {
        let update = JobUpdate::new()
            .status(JobStatus::Cancelled)
            .expect_status(&[JobStatus::Pending, JobStatus::Running]);

        let job = match self.shared.store.update(id, update).await {
            Ok(job) => job,
            Err(JobStoreError::StatusMismatch { actual, .. }) => {
                return Err(EngineError::conflict(format!(
                    "cannot cancel job in {actual} status"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let dequeued = self.shared.queue.remove(id);
        let interrupted = self.shared.in_flight.cancel(id);
        info!(job_id = %id, dequeued, interrupted, "job cancelled");
        Ok(job)
    }

    /// Record progress (0-100) for a pending or running job.
    pub async fn update_progress(&self, id: JobId, progress: i64) -> Result<Job, EngineError> {
        self.shared.update_progress(id, progress).await
    }

    /// Record the result of a running job.
    pub async fn update_result(&self, id: JobId, result: JsonMap) -> Result<Job, EngineError> {
        self.shared.update_result(id, result).await
    }

    pub async fn set_course(&self, id: JobId, course_id: CourseId) -> Result<Job, EngineError> {
        self.shared.set_course(id, course_id).await
    }

    /// Run a recovery pass now instead of waiting for the next interval.
    pub async fn recover_now(&self) -> Result<RecoveryReport, EngineError> {
        recover_pending(&self.shared).await
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.shared.stats.snapshot(
            self.shared.queue.len(),
            self.shared.in_flight.len(),
            self.is_running(),
        )
    }
}

impl Drop for JobEngine {
    fn drop(&mut self) {
        if let Some(run) = self.run_state().take() {
            run.root.cancel();
        }
    }
}

impl std::fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEngine")
            .field("running", &self.is_running())
            .field("queue", &self.shared.queue)
            .field("in_flight", &self.shared.in_flight)
            .finish()
    }
}
