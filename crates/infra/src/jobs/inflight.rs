//! Registry of jobs currently claimed by a worker.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::types::JobId;

struct InFlightJob {
    token: CancellationToken,
    handler: Option<AbortHandle>,
}

/// Maps each executing job to its cancellation token and handler task.
#[derive(Default)]
pub struct InFlight {
    jobs: Mutex<HashMap<JobId, InFlightJob>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, InFlightJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job and return a guard that unregisters it when dropped.
    ///
    /// Returns `None` when the job is already registered; the existing entry
    /// is left untouched.
    pub fn try_insert(self: &Arc<Self>, id: JobId, token: CancellationToken) -> Option<InFlightGuard> {
        match self.lock().entry(id) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(InFlightJob {
                    token,
                    handler: None,
                });
            }
        }
        Some(InFlightGuard {
            registry: Arc::clone(self),
            id,
        })
    }

    /// Remember the task running the job's handler so it can be aborted.
    pub fn attach(&self, id: JobId, handler: AbortHandle) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.handler = Some(handler);
        }
    }

    fn remove(&self, id: JobId) {
        self.lock().remove(&id);
    }

    /// Fire the job's cancellation token. Returns whether the job was in flight.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.lock().get(&id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel and abort every in-flight handler, returning the affected ids.
    pub fn abandon_all(&self) -> Vec<JobId> {
        let jobs = self.lock();
        jobs.iter()
            .map(|(id, entry)| {
                entry.token.cancel();
                if let Some(handler) = &entry.handler {
                    handler.abort();
                }
                *id
            })
            .collect()
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight").field("len", &self.len()).finish()
    }
}

/// Removes the job from the registry on drop.
pub struct InFlightGuard {
    registry: Arc<InFlight>,
    id: JobId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
