//! Job handlers and the registry that routes job kinds to them.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use super::context::JobContext;
use super::error::EngineError;
use super::types::JobKind;

/// Executes the work for one job kind.
///
/// The handler receives an owned [`JobContext`] and reports progress and the
/// result through it. Returning an error marks the job failed.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap `f` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.f)(ctx).await
    }
}

/// Concurrency-safe map from job kind to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Result<(), EngineError> {
        kind.validate()?;
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.clone(), handler)
            .is_some();
        if replaced {
            tracing::debug!(kind = %kind, "replaced job handler");
        } else {
            tracing::debug!(kind = %kind, "registered job handler");
        }
        Ok(())
    }

    pub fn get(&self, kind: &JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    pub fn contains(&self, kind: &JobKind) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(kind)
    }

    /// Kinds with a registered handler, sorted by name.
    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
