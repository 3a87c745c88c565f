//! # Worker Pool
//!
//! Executes typed tasks (priority computation, prefetch analysis, batch
//! preparation) off the sequencer's control path, with bounded concurrency,
//! dependency-ordering, per-task timeout/retry, and cancellation.

pub mod pool;
pub mod task;

pub use pool::{PoolStats, TaskHandler, WorkerPool};
pub use task::{Task, TaskKind, TaskOutput, TaskPayload, TaskStatus};

use thiserror::Error;

/// Errors a [`TaskHandler`] may return; timeouts are detected by the pool
/// itself and do not need a dedicated variant here.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("worker terminated")]
    Terminated,

    #[error("no handler registered for task kind")]
    NoHandler,

    #[error("dependency cycle or missing dependency: {0}")]
    DependencyError(String),
}

/// Result alias for worker-pool operations.
pub type WorkerResult<T> = Result<T, WorkerError>;
