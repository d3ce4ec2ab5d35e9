//! Asynchronous job-processing engine.
//!
//! ## Design
//!
//! - Jobs are persisted before they are scheduled; the store is the source of truth
//! - A bounded in-memory dispatch queue feeds a fixed pool of workers
//! - Dispatch is by priority (FIFO within a priority) unless configured as strict FIFO
//! - Status transitions are guarded writes, so a cancelled job stays cancelled
//! - Each running job has its own cancellation token derived from the engine's
//! - Pending jobs are recovered from the store on start and periodically afterwards
//! - Shutdown is bounded; jobs still running at the deadline are abandoned as failed
//!
//! ## Components
//!
//! - `Job`: the unit of work and its state
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `HandlerRegistry`: job kind → `JobHandler`
//! - `JobEngine`: admission, cancellation, progress/result updates, start/stop
//! - `handlers`: default handlers for the built-in kinds

pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod inflight;
pub mod postgres;
pub mod registry;
pub mod stats;
pub mod store;
pub mod types;
pub mod worker;


pub use context::{JobCancelled, JobContext};
pub use dispatch::{DispatchQueue, PushError};
pub use engine::{JobEngine, ShutdownReport, ABANDONED_ON_SHUTDOWN};
pub use error::EngineError;
pub use handlers::{register_default_handlers, ContentPipeline, CourseRequest, GeneratedCourse, ProcessingOptions};
pub use postgres::PostgresJobStore;
pub use registry::{handler_fn, HandlerRegistry, JobHandler};
pub use stats::EngineStatsSnapshot;
pub use store::{InMemoryJobStore, JobFilter, JobOrder, JobPage, JobStore, JobStoreError, JobUpdate};
pub use types::{Job, JobId, JobKind, JobStatus, JsonMap, Principal, Priority};
pub use worker::{JobOutcome, RecoveryReport};
