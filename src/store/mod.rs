//! # Persistence Store Contract
//!
//! The relational store is an external collaborator (spec.md §1: "only its
//! query contract matters"). This module defines that contract —
//! [`StoreClient`] — plus two implementations: [`memory::InMemoryStore`]
//! for tests and a dependency-free dev loop, and [`sqlite::SqlxStore`]
//! against `sqlx`/SQLite (teacher's own default per
//! `database::connection_pool::DatabaseConfig`), which is what `main.rs`
//! wires up by default.
//!
//! The one hard requirement spec.md places on any implementation: batch-id
//! assignment across a batch's transactions is atomic (all rows update
//! together or none do), and row-level status updates are visible
//! immediately to subsequent reads (spec.md §1 Non-goals: "full ACID over
//! the batch database ... we require atomic batch-id assignment and
//! row-level status updates only").

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Account, Batch, BatchStatus, InconsistencyType, Transaction, TransactionStatus};

pub use memory::InMemoryStore;
pub use sqlite::SqlxStore;

/// Errors surfaced by the persistence boundary.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Row appended to `audit_log` whenever a recovery strategy overwrites a
/// stored value (spec.md §4.6 balance/nonce strategies "write audit
/// trail"), grounded in the teacher's `enterprise::audit::event::AuditEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub subject_type: InconsistencyType,
    pub subject_id: String,
    pub previous_value: String,
    pub new_value: String,
    pub recorded_at: DateTime<Utc>,
}

/// Query contract the sequencer and recovery engine depend on. Both
/// implementations below satisfy it identically from the caller's point of
/// view; only the storage medium differs.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn insert_transaction(&self, tx: &Transaction) -> StoreResult<()>;
    async fn get_transaction(&self, id: &str) -> StoreResult<Option<Transaction>>;
    async fn pending_transactions(&self, limit: usize) -> StoreResult<Vec<Transaction>>;

    /// Atomically persists a batch row and stamps `batch_id` onto every
    /// transaction in `tx_ids` — the one atomicity guarantee spec.md §1
    /// requires of the store.
    async fn assign_batch(&self, batch: &Batch, tx_ids: &[String]) -> StoreResult<()>;

    async fn update_batch_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        signature: Option<String>,
        error: Option<String>,
    ) -> StoreResult<()>;

    async fn get_batch(&self, id: &str) -> StoreResult<Option<Batch>>;

    /// Marks every transaction in `tx_ids` with `status`, optionally
    /// attaching `error` and a fresh `processed_at`.
    async fn update_transactions_status(
        &self,
        tx_ids: &[String],
        status: TransactionStatus,
        error: Option<String>,
    ) -> StoreResult<()>;

    /// Resets a transaction to `Pending` for recovery reprocessing,
    /// incrementing its retry count and clearing its prior `batch_id`.
    async fn requeue_transaction(&self, id: &str) -> StoreResult<Option<Transaction>>;

    async fn get_account(&self, address: &str) -> StoreResult<Account>;
    async fn upsert_account(&self, account: &Account) -> StoreResult<()>;

    /// All confirmed transactions sent by `address`, used by the nonce and
    /// balance recovery detectors to recompute ground truth.
    async fn confirmed_transactions_for_sender(&self, address: &str) -> StoreResult<Vec<Transaction>>;

    /// All confirmed transactions received by `address` (credits side of
    /// the balance invariant).
    async fn confirmed_transactions_for_recipient(&self, address: &str) -> StoreResult<Vec<Transaction>>;

    async fn insert_audit_record(&self, record: AuditRecord) -> StoreResult<()>;
}
