use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::Transaction;
use crate::queue::PriorityResult;

/// Closed set of work the pool executes, carrying strongly-typed data
/// instead of an opaque job-type string plus JSON blob (spec.md §9's
/// tagged-variant guidance for dynamic dispatch).
#[derive(Debug, Clone)]
pub enum TaskPayload {
    PriorityComputation { transaction: Transaction },
    PrefetchAnalysis { keys: Vec<String> },
    BatchPreparation { batch_id: String, transactions: Vec<Transaction> },
}

/// Discriminant used to key the handler registry, independent of the data a
/// given payload instance carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    PriorityComputation,
    PrefetchAnalysis,
    BatchPreparation,
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::PriorityComputation { .. } => TaskKind::PriorityComputation,
            TaskPayload::PrefetchAnalysis { .. } => TaskKind::PrefetchAnalysis,
            TaskPayload::BatchPreparation { .. } => TaskKind::BatchPreparation,
        }
    }
}

/// A handler's typed result, routed back to whichever component requested
/// the work (the queue for priority results, the cache for prefetch hits,
/// the sequencer for batch preparation).
#[derive(Debug, Clone)]
pub enum TaskOutput {
    Priority(PriorityResult),
    Prefetched(Vec<String>),
    BatchPrepared { batch_id: String, merkle_root: String },
}

/// Lifecycle status of a task. One-way except `pending` <-> `running`
/// during a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A unit of work submitted to the worker pool.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub payload: TaskPayload,
    pub priority: f64,
    pub max_retries: u32,
    pub retry_count: u32,
    pub timeout: Duration,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(payload: TaskPayload, priority: f64, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            priority,
            max_retries: 3,
            retry_count: 0,
            timeout,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }
}
