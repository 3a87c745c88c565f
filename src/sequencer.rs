//! # Sequencer
//!
//! Validates inbound transactions, rejects content-hash duplicates, persists
//! them pending, and hands them to the [`PriorityQueue`](crate::queue::PriorityQueue).
//! When the queue announces a [`QueueEvent::BatchReady`], the sequencer hands
//! the batch to the worker pool as a `BatchPreparation` task rather than
//! building the merkle root and submitting on its own control path —
//! the same one-way, tagged-variant dispatch the queue uses for priority
//! computation (spec.md §9). [`BatchPreparationHandler`] is the registered
//! handler: it builds the batch, assigns it atomically in the store,
//! compresses and submits it through the circuit-breaker-wrapped external
//! client, and reconciles transaction/account state on both outcomes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};

use crate::cache::{MultiLevelCache, SetOptions};
use crate::client::{ClientError, ExternalClient};
use crate::config::SequencerConfig;
use crate::metrics::MetricRegistry;
use crate::model::{Account, Batch, BatchStatus, Transaction, TransactionStatus, TransactionType};
use crate::queue::{PriorityQueue, QueueEvent};
use crate::store::{StoreClient, StoreError};
use crate::workers::{Task, TaskHandler, TaskKind, TaskOutput, TaskPayload, WorkerError, WorkerPool, WorkerResult};

/// Errors surfaced by the sequencer's public contract.
#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("duplicate transaction content: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("client error: {0}")]
    Client(#[from] ClientError),
}

/// Result alias for sequencer operations.
pub type SequencerResult<T> = Result<T, SequencerError>;

/// Caller-supplied fields for a new transaction; the sequencer fills in
/// `id`, `status`, `created_at`, and `priority`.
#[derive(Debug, Clone)]
pub struct TransactionInput {
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
    pub nonce: u64,
    pub expiry_timestamp: chrono::DateTime<Utc>,
    pub transaction_type: TransactionType,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
    pub fee: u64,
}

impl TransactionInput {
    fn into_transaction(self) -> Transaction {
        Transaction {
            id: String::new(),
            sender: self.sender,
            recipient: self.recipient,
            amount: self.amount,
            nonce: self.nonce,
            expiry_timestamp: self.expiry_timestamp,
            transaction_type: self.transaction_type,
            data: self.data,
            signature: self.signature,
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            batch_id: None,
            error: None,
            priority: 0.0,
            retry_count: 0,
            fee: self.fee,
        }
        .with_generated_id()
    }
}

/// Snapshot returned by [`Sequencer::get_stats`].
#[derive(Debug, Clone)]
pub struct SequencerStats {
    pub queue_depth: usize,
    pub queue_dropped: u64,
    pub pool_active_workers: usize,
    pub pool_tasks_completed: u64,
    pub pool_tasks_failed: u64,
    pub dedup_entries: usize,
    pub poll_interval_ms: u64,
    pub circuit_state: crate::client::CircuitState,
}

/// Bounded content-hash dedup window. A hash seen before is rejected as a
/// duplicate submission; the oldest entry is evicted once `capacity` is
/// exceeded, in insertion order.
struct DedupCache {
    capacity: usize,
    seen: Mutex<(HashMap<String, ()>, VecDeque<String>)>,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: Mutex::new((HashMap::new(), VecDeque::new())),
        }
    }

    /// Returns `true` if `hash` was already present (a duplicate).
    fn check_and_insert(&self, hash: String) -> bool {
        let mut guard = self.seen.lock();
        if guard.0.contains_key(&hash) {
            return true;
        }
        guard.0.insert(hash.clone(), ());
        guard.1.push_back(hash);
        while guard.1.len() > self.capacity {
            if let Some(oldest) = guard.1.pop_front() {
                guard.0.remove(&oldest);
            }
        }
        false
    }

    fn len(&self) -> usize {
        self.seen.lock().0.len()
    }
}

/// Validates, deduplicates, persists, and dispatches transactions; reacts to
/// the queue's batch-ready events by handing work to the worker pool.
pub struct Sequencer {
    store: Arc<dyn StoreClient>,
    queue: Arc<PriorityQueue>,
    worker_pool: Arc<WorkerPool>,
    cache: Arc<MultiLevelCache>,
    metrics: MetricRegistry,
    config: SequencerConfig,
    dedup: DedupCache,
    batch_size_hint: usize,
    batch_task_timeout: Duration,
    poll_interval_ms: AtomicU64,
}

impl Sequencer {
    pub fn new(
        store: Arc<dyn StoreClient>,
        queue: Arc<PriorityQueue>,
        worker_pool: Arc<WorkerPool>,
        cache: Arc<MultiLevelCache>,
        metrics: MetricRegistry,
        config: SequencerConfig,
        batch_size_hint: usize,
        batch_task_timeout: Duration,
    ) -> Arc<Self> {
        let initial_poll = config.max_poll_interval_ms;
        let dedup = DedupCache::new(config.dedup_capacity);
        Arc::new(Self {
            store,
            queue,
            worker_pool,
            cache,
            metrics,
            config,
            dedup,
            batch_size_hint,
            batch_task_timeout,
            poll_interval_ms: AtomicU64::new(initial_poll),
        })
    }

    fn validate(&self, tx: &Transaction) -> SequencerResult<()> {
        if tx.sender.is_empty() || tx.recipient.is_empty() {
            return Err(SequencerError::Validation("sender and recipient are required".into()));
        }
        if tx.sender == tx.recipient {
            return Err(SequencerError::Validation("sender and recipient must differ".into()));
        }
        if tx.amount == 0 {
            return Err(SequencerError::Validation("amount must be positive".into()));
        }
        if tx.expiry_timestamp <= Utc::now() {
            return Err(SequencerError::Validation("expiry_timestamp is in the past".into()));
        }
        Ok(())
    }

    /// Validates, rejects duplicates, persists as pending, and enqueues.
    pub async fn add_transaction(&self, input: TransactionInput) -> SequencerResult<String> {
        let tx = input.into_transaction();
        self.validate(&tx)?;

        let hash = tx.content_hash().to_hex().to_string();
        if self.dedup.check_and_insert(hash) {
            return Err(SequencerError::Duplicate(tx.id));
        }

        self.store.insert_transaction(&tx).await?;
        self.metrics.counter("sequencer_transactions_accepted_total").inc();
        let id = tx.id.clone();
        if !self.queue.enqueue(tx) {
            self.metrics.counter("sequencer_transactions_rejected_total").inc();
            return Err(SequencerError::Validation("queue rejected transaction (backpressure)".into()));
        }
        Ok(id)
    }

    /// Same as [`Self::add_transaction`] but raises the transaction's
    /// initial priority to at least `level / 10` (levels are clamped to
    /// `1..=10`), letting callers fast-track urgent transfers ahead of the
    /// fee/age/size/sender score.
    pub async fn add_priority_transaction(&self, input: TransactionInput, level: u8) -> SequencerResult<String> {
        let id = self.add_transaction(input).await?;
        let explicit = (level.clamp(1, 10) as f64) / 10.0;
        if let Some(current) = self.queue.peek(&id) {
            if explicit > current.priority {
                self.queue.update_priority(&id, explicit);
            }
        }
        Ok(id)
    }

    pub async fn get_transaction_status(&self, id: &str) -> SequencerResult<Transaction> {
        self.store
            .get_transaction(id)
            .await?
            .ok_or_else(|| SequencerError::NotFound(id.to_string()))
    }

    pub async fn get_batch_status(&self, id: &str) -> SequencerResult<Batch> {
        self.store
            .get_batch(id)
            .await?
            .ok_or_else(|| SequencerError::NotFound(id.to_string()))
    }

    pub async fn get_account_balance(&self, address: &str) -> SequencerResult<Account> {
        Ok(self.store.get_account(address).await?)
    }

    pub fn get_stats(&self) -> SequencerStats {
        let pool_stats = self.worker_pool.stats();
        SequencerStats {
            queue_depth: self.queue.size(),
            queue_dropped: self.queue.dropped_count(),
            pool_active_workers: pool_stats.active_workers,
            pool_tasks_completed: pool_stats.tasks_completed,
            pool_tasks_failed: pool_stats.tasks_failed,
            dedup_entries: self.dedup.len(),
            poll_interval_ms: self.poll_interval_ms.load(Ordering::Relaxed),
            circuit_state: crate::client::CircuitState::Closed,
        }
    }

    /// Spawns the batch-dispatch loop (consumes `QueueEvent::BatchReady` and
    /// submits `BatchPreparation` tasks) and the adaptive re-seeding poll
    /// loop (re-enqueues any store-pending transaction the in-memory queue
    /// lost across a restart, tightening its own interval as pending count
    /// rises).
    pub fn spawn_background_tasks(self: &Arc<Self>, mut event_rx: broadcast::Receiver<QueueEvent>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let dispatch_sequencer = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(QueueEvent::BatchReady { batch_id, .. }) => {
                        let Some(transactions) = dispatch_sequencer.queue.dequeue_batch(&batch_id) else {
                            continue;
                        };
                        let task = Task::new(
                            TaskPayload::BatchPreparation { batch_id, transactions },
                            1.0,
                            dispatch_sequencer.batch_task_timeout,
                        );
                        dispatch_sequencer.worker_pool.submit(task);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let poll_sequencer = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            loop {
                let interval_ms = poll_sequencer.poll_interval_ms.load(Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;

                let limit = poll_sequencer.batch_size_hint.max(1) * 10;
                let pending = match poll_sequencer.store.pending_transactions(limit).await {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                for tx in &pending {
                    if poll_sequencer.queue.peek(&tx.id).is_none() {
                        poll_sequencer.queue.enqueue(tx.clone());
                    }
                }

                let ratio = (pending.len() as f64 / poll_sequencer.batch_size_hint.max(1) as f64).min(1.0);
                let min = poll_sequencer.config.min_poll_interval_ms as f64;
                let max = poll_sequencer.config.max_poll_interval_ms as f64;
                let next = (max - (max - min) * ratio).round() as u64;
                poll_sequencer.poll_interval_ms.store(next.max(poll_sequencer.config.min_poll_interval_ms), Ordering::Relaxed);
                poll_sequencer.metrics.gauge("sequencer_poll_interval_ms").set(next as f64);
                poll_sequencer.metrics.gauge("sequencer_pending_count").set(pending.len() as f64);
            }
        }));

        handles
    }
}

/// Registered against [`TaskKind::BatchPreparation`]: builds the merkle
/// root, assigns the batch atomically in the store, submits through the
/// circuit-breaker-wrapped client, and reconciles transaction/account state.
/// Returning `Err` lets the pool's own retry/backoff drive resubmission —
/// safe because [`ExternalClient::submit_batch`] is idempotent by merkle
/// root.
pub struct BatchPreparationHandler {
    store: Arc<dyn StoreClient>,
    client: Arc<ExternalClient>,
    queue: Arc<PriorityQueue>,
    cache: Arc<MultiLevelCache>,
    metrics: MetricRegistry,
    semaphore: Arc<Semaphore>,
    in_flight: DashSet<String>,
    compression_threshold: usize,
    compression_algorithm: crate::config::CompressionAlgorithm,
    failed_batches: AtomicUsize,
}

impl BatchPreparationHandler {
    pub fn new(
        store: Arc<dyn StoreClient>,
        client: Arc<ExternalClient>,
        queue: Arc<PriorityQueue>,
        cache: Arc<MultiLevelCache>,
        metrics: MetricRegistry,
        max_concurrent_batches: usize,
        compression_threshold: usize,
        compression_algorithm: crate::config::CompressionAlgorithm,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            client,
            queue,
            cache,
            metrics,
            semaphore: Arc::new(Semaphore::new(max_concurrent_batches.max(1))),
            in_flight: DashSet::new(),
            compression_threshold,
            compression_algorithm,
            failed_batches: AtomicUsize::new(0),
        })
    }

    pub fn failed_batch_count(&self) -> usize {
        self.failed_batches.load(Ordering::Relaxed)
    }

    async fn process_batch(&self, batch_id: &str, transactions: &[Transaction]) -> WorkerResult<TaskOutput> {
        let batch = Batch::new(transactions);
        let tx_ids: Vec<String> = transactions.iter().map(|t| t.id.clone()).collect();

        self.store
            .assign_batch(&batch, &tx_ids)
            .await
            .map_err(|e| WorkerError::TaskFailed(e.to_string()))?;
        self.store
            .update_batch_status(&batch.id, BatchStatus::Submitted, None, None)
            .await
            .map_err(|e| WorkerError::TaskFailed(e.to_string()))?;

        let encoded = crate::cache::encode(&transactions.to_vec(), self.compression_threshold, self.compression_algorithm)
            .map_err(|e| WorkerError::TaskFailed(e.to_string()))?;

        match self.client.submit_batch(encoded.bytes, &batch.merkle_root).await {
            Ok(receipt) => {
                self.on_success(&batch, &tx_ids, transactions, receipt.signature).await;
                self.metrics.counter("sequencer_batches_confirmed_total").inc();
                Ok(TaskOutput::BatchPrepared { batch_id: batch_id.to_string(), merkle_root: batch.merkle_root })
            }
            Err(err) => {
                self.on_failure(&batch, &tx_ids, transactions, &err).await;
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.metrics.counter("sequencer_batches_errored_total").inc();
                Err(WorkerError::TaskFailed(err.to_string()))
            }
        }
    }

    async fn on_success(&self, batch: &Batch, tx_ids: &[String], transactions: &[Transaction], signature: String) {
        let _ = self
            .store
            .update_batch_status(&batch.id, BatchStatus::Confirmed, Some(signature), None)
            .await;
        let _ = self.store.update_transactions_status(tx_ids, TransactionStatus::Processed, None).await;

        for tx in transactions {
            self.apply_account_effects(tx).await;
            self.queue.record_sender_outcome(&tx.sender, true);
            let mut confirmed = tx.clone();
            confirmed.status = TransactionStatus::Processed;
            let _ = self
                .cache
                .set(&format!("tx:{}", tx.id), &confirmed, SetOptions::default())
                .await;
        }
        let _ = self.cache.invalidate(&format!("batch:{}", batch.id)).await;
    }

    async fn on_failure(&self, batch: &Batch, tx_ids: &[String], transactions: &[Transaction], err: &ClientError) {
        let message = err.to_string();
        let _ = self
            .store
            .update_batch_status(&batch.id, BatchStatus::Errored, None, Some(message.clone()))
            .await;
        let _ = self
            .store
            .update_transactions_status(tx_ids, TransactionStatus::Errored, Some(message))
            .await;
        for tx in transactions {
            self.queue.record_sender_outcome(&tx.sender, false);
        }
    }

    async fn apply_account_effects(&self, tx: &Transaction) {
        if let Ok(mut sender) = self.store.get_account(&tx.sender).await {
            sender.balance -= tx.amount as i128;
            sender.nonce = sender.nonce.max(tx.nonce + 1);
            sender.last_updated = Utc::now();
            let _ = self.store.upsert_account(&sender).await;
        }
        if let Ok(mut recipient) = self.store.get_account(&tx.recipient).await {
            recipient.balance += tx.amount as i128;
            recipient.last_updated = Utc::now();
            let _ = self.store.upsert_account(&recipient).await;
        }
    }
}

#[async_trait]
impl TaskHandler for BatchPreparationHandler {
    async fn handle(&self, task: &Task) -> WorkerResult<TaskOutput> {
        let TaskPayload::BatchPreparation { batch_id, transactions } = &task.payload else {
            return Err(WorkerError::TaskFailed("BatchPreparationHandler received the wrong payload kind".into()));
        };

        if !self.in_flight.insert(batch_id.clone()) {
            return Err(WorkerError::TaskFailed(format!("batch {batch_id} already in flight")));
        }
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::TaskFailed("semaphore closed".into()))?;

        let result = self.process_batch(batch_id, transactions).await;
        self.in_flight.remove(batch_id);
        result
    }
}

/// Marker so the worker pool's handler registry keys on the right kind
/// without callers needing to spell out `TaskKind::BatchPreparation`.
pub fn task_kind() -> TaskKind {
    TaskKind::BatchPreparation
}
