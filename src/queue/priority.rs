use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::config::{PriorityWeights, QueueConfig};
use crate::heap::IndexedHeap;
use crate::model::Transaction;

/// A transaction whose priority the queue wants recomputed off its own
/// control path. Published on the queue's outbound channel; a worker pool
/// consumes it and replies with a [`PriorityResult`].
#[derive(Debug, Clone)]
pub struct PriorityRequest {
    pub id: String,
    pub transaction: Transaction,
}

/// The worker pool's answer to a [`PriorityRequest`], applied back into the
/// queue via [`PriorityQueue::apply_priority_result`].
#[derive(Debug, Clone)]
pub struct PriorityResult {
    pub id: String,
    pub priority: f64,
}

/// Hysteresis state for enqueue-side backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureState {
    Active,
    Inactive,
}

/// Events the queue emits for observers (metrics, logging, the sequencer).
#[derive(Debug, Clone)]
pub enum QueueEvent {
    BatchReady { batch_id: String, size: usize },
    Dropped { id: String },
    BackpressureChanged { state: BackpressureState },
}

#[derive(Debug, Default, Clone, Copy)]
struct SenderStats {
    success: u64,
    total: u64,
}

/// Priority queue: heap plus aging, adaptive reweighting, backpressure, and
/// batch assembly.
pub struct PriorityQueue {
    heap: Mutex<IndexedHeap<Transaction>>,
    config: QueueConfig,
    weights: Mutex<PriorityWeights>,
    backpressure: AtomicBool,
    shutting_down: AtomicBool,
    dropped: AtomicU64,
    sender_stats: DashMap<String, SenderStats>,
    pending_batches: DashMap<String, Vec<Transaction>>,
    event_tx: broadcast::Sender<QueueEvent>,
    priority_request_tx: Option<mpsc::UnboundedSender<PriorityRequest>>,
}

impl PriorityQueue {
    /// Builds a new queue. `priority_request_tx` is the input side of the
    /// channel a worker pool listens on; pass `None` to compute priority
    /// synchronously only (useful for tests).
    pub fn new(
        config: QueueConfig,
        priority_request_tx: Option<mpsc::UnboundedSender<PriorityRequest>>,
    ) -> (Arc<Self>, broadcast::Receiver<QueueEvent>) {
        let (event_tx, event_rx) = broadcast::channel(1024);
        let weights = config.priority_weights;
        let queue = Arc::new(Self {
            heap: Mutex::new(IndexedHeap::new()),
            config,
            weights: Mutex::new(weights),
            backpressure: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            sender_stats: DashMap::new(),
            pending_batches: DashMap::new(),
            event_tx,
            priority_request_tx,
        });
        (queue, event_rx)
    }

    pub fn size(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Assigns id/timestamp if missing, computes an initial priority score,
    /// inserts into the heap, and (if wired) dispatches a refinement
    /// request to the worker pool. Never panics; returns `false` and
    /// increments the dropped counter on any internal failure.
    pub fn enqueue(&self, mut tx: Transaction) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }

        let size_before = self.heap.lock().len();
        if self.update_backpressure(size_before) {
            self.record_drop(&tx.id);
            return false;
        }

        if tx.id.is_empty() {
            tx.id = Uuid::new_v4().to_string();
        }

        let priority = self.compute_priority(&tx);
        tx.priority = priority;
        let id = tx.id.clone();
        let timestamp = tx.created_at;

        let inserted = self.heap.lock().insert(id.clone(), priority, timestamp, tx.clone());
        if !inserted {
            self.record_drop(&id);
            return false;
        }

        if let Some(sender) = &self.priority_request_tx {
            let _ = sender.send(PriorityRequest { id, transaction: tx });
        }

        true
    }

    /// Re-enqueues a transaction that failed priority computation in a
    /// worker, incrementing its retry count. Drops it permanently (and
    /// counts the drop) once `max_retries` is exceeded.
    pub fn requeue_with_retry(&self, mut tx: Transaction) -> bool {
        if tx.retry_count >= self.config.max_retries {
            self.record_drop(&tx.id);
            return false;
        }
        tx.retry_count += 1;
        self.enqueue(tx)
    }

    /// Applies a priority computed asynchronously by a worker, if the
    /// transaction is still queued.
    pub fn apply_priority_result(&self, result: PriorityResult) -> bool {
        self.heap.lock().update_priority(&result.id, result.priority.clamp(0.0, 1.0))
    }

    /// Scores a transaction by the same fee/age/size/sender formula
    /// `enqueue` uses, for a worker handling a [`PriorityRequest`] off the
    /// queue's own control path.
    pub fn score(&self, tx: &Transaction) -> f64 {
        self.compute_priority(tx)
    }

    pub fn dequeue(&self, n: usize) -> Vec<Transaction> {
        self.heap.lock().drain_top(n).into_iter().map(|e| e.payload).collect()
    }

    pub fn dequeue_batch(&self, batch_id: &str) -> Option<Vec<Transaction>> {
        self.pending_batches.remove(batch_id).map(|(_, txs)| txs)
    }

    pub fn update_priority(&self, id: &str, priority: f64) -> bool {
        self.heap.lock().update_priority(id, priority.clamp(0.0, 1.0))
    }

    pub fn boost_priority(&self, id: &str, factor: f64) -> bool {
        let mut heap = self.heap.lock();
        let Some(current) = heap.peek(id).map(|e| e.priority) else {
            return false;
        };
        heap.update_priority(id, (current * factor).min(1.0))
    }

    pub fn decrease_priority(&self, id: &str, factor: f64) -> bool {
        let mut heap = self.heap.lock();
        let Some(current) = heap.peek(id).map(|e| e.priority) else {
            return false;
        };
        heap.update_priority(id, (current * factor).max(0.0))
    }

    pub fn remove(&self, id: &str) -> Option<Transaction> {
        self.heap.lock().remove(id).map(|e| e.payload)
    }

    pub fn peek(&self, id: &str) -> Option<Transaction> {
        self.heap.lock().peek(id).map(|e| e.payload.clone())
    }

    pub fn peek_highest(&self) -> Option<Transaction> {
        self.heap.lock().peek_highest().map(|e| e.payload.clone())
    }

    /// Records a sender's outcome (success/failure of a confirmed batch),
    /// feeding the `sigma` term of the priority function.
    pub fn record_sender_outcome(&self, sender: &str, success: bool) {
        let mut stats = self.sender_stats.entry(sender.to_string()).or_default();
        stats.total += 1;
        if success {
            stats.success += 1;
        }
    }

    /// Extracts up to `batch_size` entries in priority order, registers
    /// them under a fresh batch id in the pending-batch map, and emits
    /// `BatchReady`. Returns `None` if the queue is empty or shutting down.
    pub fn try_assemble_batch(&self, batch_size: usize) -> Option<(String, Vec<Transaction>)> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return None;
        }
        let txs = self.dequeue(batch_size);
        if txs.is_empty() {
            return None;
        }
        let batch_id = Uuid::new_v4().to_string();
        self.pending_batches.insert(batch_id.clone(), txs.clone());
        let _ = self.event_tx.send(QueueEvent::BatchReady {
            batch_id: batch_id.clone(),
            size: txs.len(),
        });
        Some((batch_id, txs))
    }

    /// Applies the aging policy: entries older than `aging_interval` have
    /// their priority multiplied by `1 + (age/interval)*(aging_factor-1)`,
    /// capped at 1.0; only changes exceeding 5% are written back.
    pub fn apply_aging(&self, now: DateTime<Utc>) {
        let interval_secs = (self.config.aging_interval_ms as f64 / 1000.0).max(1e-9);
        let aging_factor = self.config.aging_factor;
        self.heap.lock().apply_aging(|entry| {
            let age_secs = (now - entry.timestamp).num_milliseconds() as f64 / 1000.0;
            if age_secs < interval_secs {
                return None;
            }
            let multiplier = 1.0 + (age_secs / interval_secs) * (aging_factor - 1.0);
            let new_priority = (entry.priority * multiplier).min(1.0);
            let denom = entry.priority.abs().max(1e-9);
            if ((new_priority - entry.priority).abs() / denom) > 0.05 {
                Some(new_priority)
            } else {
                None
            }
        });
    }

    /// Inspects fill ratio and nudges weights toward favoring fee (above
    /// 50% fill) or back toward configured defaults (otherwise).
    pub fn apply_adaptive_reweight(&self) {
        let fill_ratio = self.size() as f64 / self.config.max_queue_size.max(1) as f64;
        let defaults = self.config.priority_weights;
        let mut weights = self.weights.lock();
        *weights = adjust_weights(*weights, defaults, fill_ratio);
    }

    fn compute_priority(&self, tx: &Transaction) -> f64 {
        let weights = *self.weights.lock();
        let fee_hat = (tx.fee as f64 / self.config.fee_max.max(1.0)).min(1.0);
        let age_secs = (Utc::now() - tx.created_at).num_milliseconds() as f64 / 1000.0;
        let age_hat = (age_secs.max(0.0) / self.config.age_max_secs.max(1e-9)).min(1.0);
        let size_hat = 1.0 - (tx.data.len() as f64 / self.config.size_max_bytes.max(1.0)).min(1.0);
        let sigma = self
            .sender_stats
            .get(&tx.sender)
            .map(|s| {
                if s.total == 0 {
                    0.5
                } else {
                    (s.success as f64 / s.total as f64).min(1.0)
                }
            })
            .unwrap_or(0.5);

        (weights.fee * fee_hat + weights.age * age_hat + weights.size * size_hat + weights.sender * sigma)
            .clamp(0.0, 1.0)
    }

    fn update_backpressure(&self, size: usize) -> bool {
        let max = self.config.max_queue_size.max(1) as f64;
        let high = (self.config.high_watermark * max) as usize;
        let low = (self.config.low_watermark * max) as usize;
        let was_active = self.backpressure.load(Ordering::SeqCst);

        let now_active = if was_active {
            size > low
        } else {
            size >= high
        };

        if now_active != was_active {
            self.backpressure.store(now_active, Ordering::SeqCst);
            let _ = self.event_tx.send(QueueEvent::BackpressureChanged {
                state: if now_active {
                    BackpressureState::Active
                } else {
                    BackpressureState::Inactive
                },
            });
        }
        now_active
    }

    fn record_drop(&self, id: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        let _ = self.event_tx.send(QueueEvent::Dropped { id: id.to_string() });
    }

    /// Spawns the aging, adaptive-reweight, and batch-assembly background
    /// loops. The batch loop reschedules itself with jitter while the
    /// queue is non-empty and not shutting down, per spec.md §4.2.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let aging_queue = Arc::clone(self);
        let aging_interval = self.config.aging_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aging_interval);
            loop {
                ticker.tick().await;
                if aging_queue.is_shutting_down() {
                    break;
                }
                aging_queue.apply_aging(Utc::now());
            }
        }));

        let reweight_queue = Arc::clone(self);
        let adaptive_interval = self.config.adaptive_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(adaptive_interval);
            loop {
                ticker.tick().await;
                if reweight_queue.is_shutting_down() {
                    break;
                }
                reweight_queue.apply_adaptive_reweight();
            }
        }));

        let batch_queue = Arc::clone(self);
        let batch_interval_ms = self.config.batch_interval_ms;
        let batch_size = self.config.batch_size;
        handles.push(tokio::spawn(async move {
            loop {
                let jitter = rand::thread_rng().gen_range(0..=batch_interval_ms / 4 + 1);
                tokio::time::sleep(std::time::Duration::from_millis(batch_interval_ms + jitter)).await;
                if batch_queue.is_shutting_down() {
                    break;
                }
                if batch_queue.size() == 0 {
                    continue;
                }
                batch_queue.try_assemble_batch(batch_size);
            }
        }));

        handles
    }
}

fn adjust_weights(current: PriorityWeights, defaults: PriorityWeights, fill_ratio: f64) -> PriorityWeights {
    const STEP: f64 = 0.05;
    const FEE_CAP: f64 = 0.8;

    if fill_ratio > 0.5 {
        let new_fee = (current.fee + STEP).min(FEE_CAP);
        let remaining_before = (1.0 - current.fee).max(1e-9);
        let remaining_after = 1.0 - new_fee;
        let scale = remaining_after / remaining_before;
        PriorityWeights {
            fee: new_fee,
            age: current.age * scale,
            size: current.size * scale,
            sender: current.sender * scale,
        }
    } else {
        let step_toward = |c: f64, d: f64| {
            if (c - d).abs() <= STEP {
                d
            } else if c > d {
                c - STEP
            } else {
                c + STEP
            }
        };
        let fee = step_toward(current.fee, defaults.fee);
        let age = step_toward(current.age, defaults.age);
        let size = step_toward(current.size, defaults.size);
        let sender = step_toward(current.sender, defaults.sender);
        let sum = (fee + age + size + sender).max(1e-9);
        PriorityWeights {
            fee: fee / sum,
            age: age / sum,
            size: size / sum,
            sender: sender / sum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TransactionStatus, TransactionType};

    fn tx(id: &str, fee: u64) -> Transaction {
        Transaction {
            id: id.to_string(),
            sender: format!("sender-{id}"),
            recipient: "recipient".into(),
            amount: 1,
            nonce: 0,
            expiry_timestamp: Utc::now() + chrono::Duration::hours(1),
            transaction_type: TransactionType::Transfer,
            data: vec![],
            signature: vec![],
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            batch_id: None,
            error: None,
            priority: 0.0,
            retry_count: 0,
            fee,
        }
    }

    #[test]
    fn dequeue_returns_top_n_by_priority() {
        let (queue, _rx) = PriorityQueue::new(QueueConfig::default(), None);
        for fee in 100..400u64 {
            queue.enqueue(tx(&format!("tx{fee}"), fee));
        }
        let top = queue.dequeue(100);
        assert_eq!(top.len(), 100);
        let mut fees: Vec<u64> = top.iter().map(|t| t.fee).collect();
        let mut expected: Vec<u64> = (300..400).collect();
        fees.sort_unstable();
        expected.sort_unstable();
        assert_eq!(fees, expected);
        // decreasing priority order means decreasing fee order here
        let ordered_fees: Vec<u64> = top.iter().map(|t| t.fee).collect();
        assert!(ordered_fees.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn backpressure_enters_and_leaves_by_hysteresis() {
        let mut config = QueueConfig::default();
        config.max_queue_size = 10;
        config.high_watermark = 0.8;
        config.low_watermark = 0.5;
        let (queue, _rx) = PriorityQueue::new(config, None);
        for i in 0..8 {
            assert!(queue.enqueue(tx(&format!("tx{i}"), 10)));
        }
        // at high watermark (8/10), further enqueues reject
        assert!(!queue.enqueue(tx("blocked", 10)));
        queue.dequeue(4);
        // now at 4/10, below low watermark (5) -> accepts again
        assert!(queue.enqueue(tx("accepted", 10)));
    }

    #[test]
    fn aging_raises_priority_of_old_entries_preserving_order() {
        let (queue, _rx) = PriorityQueue::new(QueueConfig::default(), None);
        for i in 0..10 {
            queue.enqueue(tx(&format!("tx{i}"), 50));
        }
        let before: Vec<f64> = (0..10)
            .map(|i| queue.peek(&format!("tx{i}")).unwrap().priority)
            .collect();
        let future = Utc::now() + chrono::Duration::seconds(60);
        queue.apply_aging(future);
        let after: Vec<f64> = (0..10)
            .map(|i| queue.peek(&format!("tx{i}")).unwrap().priority)
            .collect();
        for (b, a) in before.iter().zip(after.iter()) {
            assert!(*a >= *b);
            assert!(*a <= b * 1.10 + 1e-9);
        }
    }

    #[test]
    fn dequeue_batch_consumes_registered_batch() {
        let (queue, _rx) = PriorityQueue::new(QueueConfig::default(), None);
        for i in 0..5 {
            queue.enqueue(tx(&format!("tx{i}"), 10));
        }
        let (batch_id, txs) = queue.try_assemble_batch(5).unwrap();
        assert_eq!(txs.len(), 5);
        let consumed = queue.dequeue_batch(&batch_id).unwrap();
        assert_eq!(consumed.len(), 5);
        assert!(queue.dequeue_batch(&batch_id).is_none());
    }

    #[test]
    fn requeue_with_retry_drops_beyond_max_retries() {
        let mut config = QueueConfig::default();
        config.max_retries = 1;
        let (queue, _rx) = PriorityQueue::new(config, None);
        let mut t = tx("retry-me", 10);
        t.retry_count = 1;
        assert!(!queue.requeue_with_retry(t));
        assert_eq!(queue.dropped_count(), 1);
    }
}
