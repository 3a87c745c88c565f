//! Crate-level error aggregation.
//!
//! Each subsystem defines its own `thiserror` enum and `Result` alias
//! (`QueueError`/`QueueResult`, `CacheError`/`CacheResult`, ...). This module
//! only aggregates them for callers, such as `main`, that cross subsystem
//! boundaries and want a single error type.

use thiserror::Error;

use crate::cache::CacheError;
use crate::client::ClientError;
use crate::queue::QueueError;
use crate::recovery::RecoveryError;
use crate::sequencer::SequencerError;
use crate::store::StoreError;
use crate::workers::WorkerError;

/// Aggregated crate error.
#[derive(Error, Debug)]
pub enum Error {
    /// Priority queue failure.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Cache failure.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Worker pool failure.
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Sequencer failure.
    #[error("sequencer error: {0}")]
    Sequencer(#[from] SequencerError),

    /// Recovery engine failure.
    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    /// External client / RPC failure.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// Persistence backend failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration failure.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for the aggregated crate error.
pub type Result<T> = std::result::Result<T, Error>;
