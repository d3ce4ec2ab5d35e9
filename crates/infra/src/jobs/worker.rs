//! Worker loop, result processor and recovery passes.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::context::JobContext;
use super::dispatch::PushError;
use super::engine::EngineShared;
use super::error::EngineError;
use super::store::{JobFilter, JobStoreError, JobUpdate};
use super::types::{Job, JobId, JobKind, JobStatus, JsonMap};

/// Final state of one processed job, sent from a worker to the result processor.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Pull jobs until `shutdown` fires.
pub(crate) async fn run_worker(
    worker: usize,
    shared: Arc<EngineShared>,
    shutdown: CancellationToken,
    outcomes: mpsc::Sender<JobOutcome>,
) {
    debug!(worker, "worker started");
    while let Some(job) = shared.queue.pop(&shutdown).await {
        let Some(outcome) = process_job(worker, &shared, &shutdown, job).await else {
            continue;
        };
        if let Err(e) = outcomes.try_send(outcome) {
            let outcome = e.into_inner();
            shared.stats.record_dropped_outcome();
            warn!(worker, job_id = %outcome.job_id, "result channel is full, dropping outcome");
        }
    }
    debug!(worker, "worker stopped");
}

/// Claim, execute and finalise one job. Returns `None` when the job was not
/// claimed (cancelled while queued, or already picked up elsewhere) or its
/// handler was abandoned at shutdown.
#[instrument(skip_all, fields(worker = worker, job_id = %job.id, kind = %job.kind))]
async fn process_job(
    worker: usize,
    shared: &Arc<EngineShared>,
    shutdown: &CancellationToken,
    job: Job,
) -> Option<JobOutcome> {
    let token = shutdown.child_token();
    let Some(_in_flight) = shared.in_flight.try_insert(job.id, token.clone()) else {
        debug!("job is already executing, skipping duplicate");
        return None;
    };

    let claim = JobUpdate::new()
        .status(JobStatus::Running)
        .started_at(Utc::now())
        .expect_status(&[JobStatus::Pending]);
    let claimed = match shared.store.update(job.id, claim).await {
        Ok(claimed) => claimed,
        Err(JobStoreError::StatusMismatch { actual, .. }) => {
            debug!(status = %actual, "job is no longer pending, skipping");
            return None;
        }
        Err(e) => {
            error!(error = %e, "failed to mark job running");
            return None;
        }
    };

    info!(user_id = %claimed.user_id, "processing job");
    let started = Instant::now();
    let id = claimed.id;
    let kind = claimed.kind.clone();

    let outcome = match shared.registry.get(&kind) {
        None => Err(format!("no handler registered for job type: {kind}")),
        Some(handler) => {
            let ctx = JobContext::new(claimed, token, Arc::clone(shared));
            let task = tokio::spawn(async move { handler.handle(ctx).await });
            shared.in_flight.attach(id, task.abort_handle());
            match task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(join) if join.is_panic() => Err(format!(
                    "handler panicked: {}",
                    panic_message(join.into_panic())
                )),
                Err(_) => {
                    // Only shutdown aborts handlers; the engine records the outcome.
                    warn!("handler aborted during shutdown");
                    return None;
                }
            }
        }
    };

    let (status, error) = finalize(shared, id, outcome).await;
    Some(JobOutcome {
        job_id: id,
        kind,
        status,
        error,
        elapsed: started.elapsed(),
    })
}

/// Persist the terminal state. The write only applies while the job is still
/// running, so a cancellation that landed first is kept.
async fn finalize(
    shared: &EngineShared,
    id: JobId,
    outcome: Result<(), String>,
) -> (JobStatus, Option<String>) {
    let now = Utc::now();
    let (intended, error, update) = match outcome {
        Ok(()) => {
            let mut update = JobUpdate::new()
                .status(JobStatus::Completed)
                .progress(100)
                .completed_at(now);
            match shared.store.get(id).await {
                Ok(current) if current.result.is_none() => update = update.result(JsonMap::new()),
                Ok(_) => {}
                Err(e) => warn!(job_id = %id, error = %e, "failed to read job before completion"),
            }
            (JobStatus::Completed, None, update)
        }
        Err(msg) => {
            let update = JobUpdate::new()
                .status(JobStatus::Failed)
                .error(msg.clone())
                .clear_result()
                .completed_at(now);
            (JobStatus::Failed, Some(msg), update)
        }
    };

    match shared
        .store
        .update(id, update.expect_status(&[JobStatus::Running]))
        .await
    {
        Ok(_) => (intended, error),
        Err(JobStoreError::StatusMismatch { actual, .. }) => {
            info!(job_id = %id, status = %actual, "job changed state while running, keeping it");
            (actual, None)
        }
        Err(e) => {
            error!(job_id = %id, status = %intended, error = %e, "failed to persist final job state");
            (intended, error)
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Drain worker outcomes until every worker has dropped its sender.
pub(crate) async fn run_result_processor(
    shared: Arc<EngineShared>,
    mut outcomes: mpsc::Receiver<JobOutcome>,
) {
    while let Some(outcome) = outcomes.recv().await {
        shared.stats.record_outcome(outcome.status, outcome.elapsed);
        let elapsed_ms = outcome.elapsed.as_millis() as u64;
        match outcome.status {
            JobStatus::Completed => {
                info!(job_id = %outcome.job_id, kind = %outcome.kind, elapsed_ms, "job completed")
            }
            JobStatus::Failed => warn!(
                job_id = %outcome.job_id,
                kind = %outcome.kind,
                elapsed_ms,
                error = outcome.error.as_deref().unwrap_or_default(),
                "job failed"
            ),
            status => {
                info!(job_id = %outcome.job_id, kind = %outcome.kind, %status, elapsed_ms, "job finished")
            }
        }
    }
    debug!("result processor stopped");
}

/// Summary of one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Pending jobs pushed onto the dispatch queue.
    pub queued: u64,
    /// Pending jobs already queued or executing.
    pub skipped: u64,
    /// Whether the pass stopped early because the queue filled up.
    pub queue_full: bool,
}

/// Queue every pending job in creation order, oldest first.
///
/// Pages are read with a `(created_at, id)` cursor rather than an offset:
/// workers claim jobs while the pass runs, which shrinks the pending set.
pub(crate) async fn recover_pending(shared: &EngineShared) -> Result<RecoveryReport, EngineError> {
    let base = JobFilter::new()
        .with_status(JobStatus::Pending)
        .oldest_first();
    let page_size = shared.config.recovery_page_size;
    let mut report = RecoveryReport::default();
    let mut filter = base.clone();

    'pages: loop {
        let page = shared.store.list(&filter, page_size, 0).await?;
        let fetched = page.jobs.len();
        let Some(last) = page.jobs.last().map(|job| (job.created_at, job.id)) else {
            break;
        };

        for job in page.jobs {
            if shared.in_flight.contains(job.id) {
                report.skipped += 1;
                continue;
            }
            match shared.queue.try_push(job) {
                Ok(()) => report.queued += 1,
                Err(PushError::Duplicate(_)) => report.skipped += 1,
                Err(PushError::Full(id)) => {
                    warn!(job_id = %id, "queue is full, remaining pending jobs wait for the next recovery pass");
                    report.queue_full = true;
                    break 'pages;
                }
            }
        }

        if fetched < page_size {
            break;
        }
        filter = base.clone().after(last.0, last.1);
    }

    shared.stats.record_recovery(report.queued);
    Ok(report)
}

/// Re-run recovery every `period` until `shutdown` fires.
pub(crate) async fn run_recovery_loop(
    shared: Arc<EngineShared>,
    shutdown: CancellationToken,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match recover_pending(&shared).await {
                Ok(report) if report.queued > 0 => {
                    info!(queued = report.queued, skipped = report.skipped, "recovered pending jobs")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "recovery pass failed"),
            },
        }
    }
    debug!("recovery loop stopped");
}
