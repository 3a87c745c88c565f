//! # Priority Queue
//!
//! Wraps the [indexed binary max-heap](crate::heap) with fee/age/size/sender
//! priority scoring, aging, adaptive reweighting, backpressure hysteresis,
//! and periodic batch assembly. Priority *computation* is delegated to the
//! worker pool over one-way channels (spec.md §9's cyclic-reference note):
//! the queue publishes [`PriorityRequest`]s and accepts [`PriorityResult`]s
//! pushed back to it — it never calls into a worker directly.

mod priority;

pub use priority::{BackpressureState, PriorityQueue, PriorityRequest, PriorityResult, QueueEvent};

use thiserror::Error;

/// Errors surfaced by the priority queue's public contract.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue is shutting down")]
    ShuttingDown,

    #[error("backpressure active, queue at capacity")]
    Backpressure,

    #[error("duplicate transaction id: {0}")]
    Duplicate(String),

    #[error("transaction not found: {0}")]
    NotFound(String),

    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("internal queue error: {0}")]
    Internal(String),
}

/// Result alias for priority-queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
