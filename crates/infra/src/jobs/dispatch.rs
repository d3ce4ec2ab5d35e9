//! Bounded in-memory dispatch queue between admission and the workers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchOrder;

use super::types::{Job, JobId, Priority};

/// Why a job could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("dispatch queue is full, job {0} not queued")]
    Full(JobId),
    #[error("job {0} is already queued")]
    Duplicate(JobId),
}

struct QueuedJob {
    rank: Priority,
    seq: u64,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // Max-heap: higher rank wins, then the lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    ids: HashSet<JobId>,
    next_seq: u64,
}

/// Bounded queue of job snapshots waiting for a worker.
///
/// Never blocks on push: a full queue is reported to the caller. A job id can
/// be queued at most once at a time.
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    order: DispatchOrder,
}

impl DispatchQueue {
    pub fn new(capacity: usize, order: DispatchOrder) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
            order,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn try_push(&self, job: Job) -> Result<(), PushError> {
        {
            let mut state = self.lock();
            if state.ids.contains(&job.id) {
                return Err(PushError::Duplicate(job.id));
            }
            if state.heap.len() >= self.capacity {
                return Err(PushError::Full(job.id));
            }

            let rank = match self.order {
                DispatchOrder::Priority => job.priority,
                DispatchOrder::Fifo => Priority::Normal,
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            state.ids.insert(job.id);
            state.heap.push(QueuedJob { rank, seq, job });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the next job without waiting.
    pub fn try_pop(&self) -> Option<Job> {
        let (job, more) = {
            let mut state = self.lock();
            let queued = state.heap.pop()?;
            state.ids.remove(&queued.job.id);
            (queued.job, !state.heap.is_empty())
        };
        // Pass the wake-up on so another idle worker sees the remaining jobs.
        if more {
            self.notify.notify_one();
        }
        Some(job)
    }

    /// Wait for the next job. Returns `None` once `shutdown` fires.
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<Job> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Drop a queued job. Returns whether it was present.
    pub fn remove(&self, id: JobId) -> bool {
        let mut state = self.lock();
        if !state.ids.remove(&id) {
            return false;
        }
        state.heap.retain(|queued| queued.job.id != id);
        true
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.lock().ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn order(&self) -> DispatchOrder {
        self.order
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("order", &self.order)
            .finish()
    }
}
