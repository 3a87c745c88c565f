//! # L2 Sequencer
//!
//! A Layer-2 transaction ingestion and dispatch engine: validates and
//! deduplicates inbound transactions, orders them in a priority queue,
//! assembles and submits batches to an external settlement chain through a
//! circuit-breaker-guarded client, and runs a background reconciliation pass
//! that detects and corrects state drift between this engine and the chain
//! it settles against.
//!
//! ## Architecture
//!
//! - `heap`: indexed binary max-heap underlying the priority queue
//! - `merkle`: merkle root computation over a batch's transactions
//! - `model`: the domain types — `Transaction`, `Batch`, `Account`, and the
//!   inconsistency/audit records the recovery engine produces
//! - `error`: the crate's aggregated `Error` type
//! - `config`: `Config::load` and every subsystem's configuration struct
//! - `queue`: the priority queue, aging, adaptive reweighting, and backpressure
//! - `workers`: the elastic worker pool and its task types
//! - `cache`: the three-tier (Moka/Sled/sharded) cache with invalidation and
//!   prefetching
//! - `client`: the circuit-breaker-wrapped external settlement client
//! - `store`: persistence (`InMemoryStore` and `SqlxStore`)
//! - `metrics`: counters, gauges, and histograms with Prometheus export
//! - `auth`: JWT signing/verification and role gating for the inbound API
//! - `sequencer`: validation, dedup, batch dispatch, and account settlement
//! - `recovery`: periodic detection and correction of state drift
//! - `api`: the inbound HTTP surface over `axum`

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Indexed binary max-heap.
pub mod heap;

/// Merkle root computation.
pub mod merkle;

/// Domain types.
pub mod model;

/// Aggregated error type.
pub mod error;

/// Configuration loading.
pub mod config;

/// Priority queue.
pub mod queue;

/// Elastic worker pool.
pub mod workers;

/// Multi-tier cache.
pub mod cache;

/// External settlement client.
pub mod client;

/// Persistence layer.
pub mod store;

/// Metrics registry.
pub mod metrics;

/// JWT auth and roles.
pub mod auth;

/// Transaction sequencing and batch dispatch.
pub mod sequencer;

/// Worker-pool handlers for queue priority recomputation and cache prefetch.
pub mod handlers;

/// State drift detection and correction.
pub mod recovery;

/// Inbound HTTP API.
pub mod api;

pub use error::{Error, Result};

/// Crate version, from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, from `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
