//! Engine runtime statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::types::JobStatus;

/// Counters updated by the workers, the result processor and recovery.
#[derive(Debug, Default)]
pub struct EngineStats {
    jobs_processed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    outcomes_dropped: AtomicU64,
    recovery_passes: AtomicU64,
    jobs_recovered: AtomicU64,
    handler_millis: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished job as reported to the result processor.
    pub fn record_outcome(&self, status: JobStatus, elapsed: Duration) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        self.handler_millis.fetch_add(
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        let counter = match status {
            JobStatus::Completed => &self.jobs_succeeded,
            JobStatus::Failed => &self.jobs_failed,
            JobStatus::Cancelled => &self.jobs_cancelled,
            JobStatus::Pending | JobStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_outcome(&self) {
        self.outcomes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self, recovered: u64) {
        self.recovery_passes.fetch_add(1, Ordering::Relaxed);
        self.jobs_recovered.fetch_add(recovered, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queue_depth: usize, in_flight: usize, running: bool) -> EngineStatsSnapshot {
        let processed = self.jobs_processed.load(Ordering::Relaxed);
        let handler_millis = self.handler_millis.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            running,
            jobs_processed: processed,
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            outcomes_dropped: self.outcomes_dropped.load(Ordering::Relaxed),
            recovery_passes: self.recovery_passes.load(Ordering::Relaxed),
            jobs_recovered: self.jobs_recovered.load(Ordering::Relaxed),
            avg_handler_millis: handler_millis.checked_div(processed).unwrap_or(0),
            queue_depth,
            in_flight,
        }
    }
}

/// Point-in-time view of [`EngineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct EngineStatsSnapshot {
    pub running: bool,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub outcomes_dropped: u64,
    pub recovery_passes: u64,
    pub jobs_recovered: u64,
    pub avg_handler_millis: u64,
    pub queue_depth: usize,
    pub in_flight: usize,
}
