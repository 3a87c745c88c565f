//! # Recovery Engine
//!
//! Periodically runs a fixed panel of detectors over store state, each
//! producing [`InconsistencyRecord`]s, then routes every record to the
//! strategy registered for its [`InconsistencyType`]. Strategies are
//! idempotent (re-running one against an already-corrected subject is a
//! no-op) and every corrective write goes through [`StoreClient::insert_audit_record`]
//! first, grounded in the teacher's `enterprise::audit::event::AuditEvent`.
//! A per-`(type, subject_id)` attempt counter skips and alerts past
//! `max_attempts` rather than retrying forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::client::{CircuitState, ExternalClient, L1TxStatus};
use crate::config::RecoveryConfig;
use crate::metrics::MetricRegistry;
use crate::model::{BatchStatus, InconsistencyRecord, InconsistencyType, Severity, TransactionStatus};
use crate::queue::PriorityQueue;
use crate::store::{AuditRecord, StoreClient, StoreError};

/// Errors surfaced by the recovery engine's public contract.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("detection failed: {0}")]
    Detection(String),

    #[error("strategy failed: {0}")]
    Strategy(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result alias for recovery-engine operations.
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// How far the circuit breaker's open state is tolerated before the bridge
/// detector raises a critical record — past this, a human should look at
/// the layer-1 endpoint, not the retry loop.
const BRIDGE_OPEN_CRITICAL_AFTER_CYCLES: u32 = 3;

/// How long a batch may sit in `Submitted` before the sequencer-state
/// detector considers it stuck (its worker-pool task presumably died or was
/// evicted without completing).
const STUCK_BATCH_THRESHOLD: chrono::Duration = chrono::Duration::minutes(5);

/// Outcome of one detect-and-remediate cycle, returned for observability
/// and tests.
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub detected: usize,
    pub remediated: usize,
    pub skipped_over_attempt_limit: usize,
}

/// Detects layer-1/layer-2 divergence and applies the matching correction,
/// audited and bounded by a per-subject attempt limit.
pub struct RecoveryEngine {
    store: Arc<dyn StoreClient>,
    queue: Arc<PriorityQueue>,
    client: Arc<ExternalClient>,
    metrics: MetricRegistry,
    config: RecoveryConfig,
    attempts: DashMap<(InconsistencyType, String), u32>,
    bridge_open_cycles: AtomicU32,
    stuck_batch_candidates: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
}

impl RecoveryEngine {
    pub fn new(
        store: Arc<dyn StoreClient>,
        queue: Arc<PriorityQueue>,
        client: Arc<ExternalClient>,
        metrics: MetricRegistry,
        config: RecoveryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            client,
            metrics,
            config,
            attempts: DashMap::new(),
            bridge_open_cycles: AtomicU32::new(0),
            stuck_batch_candidates: Mutex::new(HashMap::new()),
        })
    }

    /// Runs every detector once, then remediates everything found.
    pub async fn run_cycle(&self, tracked_addresses: &[String], watched_batches: &[String]) -> RecoveryResult<CycleReport> {
        let mut records = Vec::new();
        records.extend(self.detect_balance_and_nonce(tracked_addresses).await?);
        records.extend(self.detect_transaction(watched_batches).await?);
        records.extend(self.detect_sequencer_state(watched_batches).await?);
        records.extend(self.detect_bridge_state());

        self.metrics.counter("recovery_inconsistencies_detected_total").inc_by(records.len() as u64);

        let mut report = CycleReport { detected: records.len(), ..Default::default() };
        for record in records {
            if self.over_attempt_limit(&record) {
                report.skipped_over_attempt_limit += 1;
                log::warn!(
                    target: "recovery",
                    "giving up on {:?}/{} after {} attempts, raising alert",
                    record.record_type,
                    record.subject_id,
                    self.config.max_attempts
                );
                self.metrics.counter("recovery_alerts_total").inc();
                continue;
            }
            match self.remediate(&record).await {
                Ok(()) => {
                    report.remediated += 1;
                    self.attempts.remove(&(record.record_type, record.subject_id.clone()));
                }
                Err(e) => log::error!(target: "recovery", "remediation failed for {:?}/{}: {e}", record.record_type, record.subject_id),
            }
        }
        Ok(report)
    }

    fn over_attempt_limit(&self, record: &InconsistencyRecord) -> bool {
        let key = (record.record_type, record.subject_id.clone());
        let mut entry = self.attempts.entry(key).or_insert(0);
        *entry += 1;
        *entry > self.config.max_attempts
    }

    async fn remediate(&self, record: &InconsistencyRecord) -> RecoveryResult<()> {
        match record.record_type {
            InconsistencyType::Balance => self.remediate_balance(record).await,
            InconsistencyType::Nonce => self.remediate_nonce(record).await,
            InconsistencyType::Transaction => self.remediate_transaction(record).await,
            InconsistencyType::SequencerState => self.remediate_sequencer_state(record).await,
            InconsistencyType::BridgeState => self.remediate_bridge_state(record).await,
        }
    }

    /// Recomputes each tracked address's ground-truth balance and nonce
    /// from confirmed transaction history and flags a divergence from the
    /// stored account row.
    async fn detect_balance_and_nonce(&self, addresses: &[String]) -> RecoveryResult<Vec<InconsistencyRecord>> {
        let mut records = Vec::new();
        for address in addresses {
            let account = self.store.get_account(address).await?;
            let sent = self.store.confirmed_transactions_for_sender(address).await?;
            let received = self.store.confirmed_transactions_for_recipient(address).await?;

            let debits: i128 = sent.iter().map(|t| t.amount as i128).sum();
            let credits: i128 = received.iter().map(|t| t.amount as i128).sum();
            let expected_balance = credits - debits;
            if expected_balance != account.balance {
                records.push(InconsistencyRecord {
                    record_type: InconsistencyType::Balance,
                    subject_id: address.clone(),
                    details: format!("stored balance {} does not match recomputed {expected_balance}", account.balance),
                    severity: Severity::Critical,
                    detected_at: Utc::now(),
                });
            }

            let expected_nonce = sent.iter().map(|t| t.nonce + 1).max().unwrap_or(0);
            if expected_nonce != account.nonce {
                records.push(InconsistencyRecord {
                    record_type: InconsistencyType::Nonce,
                    subject_id: address.clone(),
                    details: format!("stored nonce {} diverges from recomputed {expected_nonce}", account.nonce),
                    severity: Severity::Warning,
                    detected_at: Utc::now(),
                });
            }
        }
        Ok(records)
    }

    /// Compares each watched batch's transactions' stored (layer-2) status
    /// against the chain's (layer-1) ground truth, reached through the
    /// external client keyed by the batch's merkle root. Batches the
    /// client can't answer for (no probe wired up, or the call itself
    /// failed) are skipped rather than treated as a mismatch.
    async fn detect_transaction(&self, batch_ids: &[String]) -> RecoveryResult<Vec<InconsistencyRecord>> {
        let mut records = Vec::new();
        for batch_id in batch_ids {
            let Some(batch) = self.store.get_batch(batch_id).await? else {
                continue;
            };
            let Ok(Some(l1_status)) = self.client.batch_status(&batch.merkle_root).await else {
                continue;
            };
            for tx_id in &batch.transaction_ids {
                let Some(tx) = self.store.get_transaction(tx_id).await? else {
                    continue;
                };
                let mismatched = match l1_status {
                    L1TxStatus::Confirmed => tx.status != TransactionStatus::Processed,
                    L1TxStatus::Failed => tx.status != TransactionStatus::Errored,
                    L1TxStatus::Pending => tx.status == TransactionStatus::Processed,
                };
                if mismatched {
                    records.push(InconsistencyRecord {
                        record_type: InconsistencyType::Transaction,
                        subject_id: tx_id.clone(),
                        details: format!("layer-1 status {l1_status:?} diverges from stored status {:?}", tx.status),
                        severity: Severity::Critical,
                        detected_at: Utc::now(),
                    });
                }
            }
        }
        Ok(records)
    }

    /// Flags batches sitting in `Submitted` past `STUCK_BATCH_THRESHOLD` —
    /// their preparation task likely died without reaching a terminal
    /// status.
    async fn detect_sequencer_state(&self, batch_ids: &[String]) -> RecoveryResult<Vec<InconsistencyRecord>> {
        let mut records = Vec::new();
        let now = Utc::now();
        for batch_id in batch_ids {
            let Some(batch) = self.store.get_batch(batch_id).await? else {
                continue;
            };
            if batch.status != BatchStatus::Submitted {
                self.stuck_batch_candidates.lock().remove(batch_id);
                continue;
            }
            let first_seen = *self
                .stuck_batch_candidates
                .lock()
                .entry(batch_id.clone())
                .or_insert(now);
            if now - first_seen >= STUCK_BATCH_THRESHOLD {
                records.push(InconsistencyRecord {
                    record_type: InconsistencyType::SequencerState,
                    subject_id: batch_id.clone(),
                    details: format!("batch stuck in Submitted since {first_seen}"),
                    severity: Severity::Critical,
                    detected_at: now,
                });
            }
        }
        Ok(records)
    }

    /// Flags a persistently open circuit breaker — the bridge (external
    /// blockchain RPC) has been unreachable across several recovery cycles
    /// in a row.
    fn detect_bridge_state(&self) -> Vec<InconsistencyRecord> {
        if self.client.circuit_state() == CircuitState::Open {
            let cycles = self.bridge_open_cycles.fetch_add(1, Ordering::Relaxed) + 1;
            if cycles >= BRIDGE_OPEN_CRITICAL_AFTER_CYCLES {
                return vec![InconsistencyRecord {
                    record_type: InconsistencyType::BridgeState,
                    subject_id: "external_client".to_string(),
                    details: format!("circuit breaker open across {cycles} consecutive recovery cycles"),
                    severity: Severity::Critical,
                    detected_at: Utc::now(),
                }];
            }
        } else {
            self.bridge_open_cycles.store(0, Ordering::Relaxed);
        }
        Vec::new()
    }

    async fn remediate_balance(&self, record: &InconsistencyRecord) -> RecoveryResult<()> {
        let address = &record.subject_id;
        let mut account = self.store.get_account(address).await?;
        let previous = account.balance.to_string();

        let sent = self.store.confirmed_transactions_for_sender(address).await?;
        let received = self.store.confirmed_transactions_for_recipient(address).await?;
        let debits: i128 = sent.iter().map(|t| t.amount as i128).sum();
        let credits: i128 = received.iter().map(|t| t.amount as i128).sum();
        account.balance = credits - debits;
        account.last_updated = Utc::now();
        self.store.upsert_account(&account).await?;

        self.audit(InconsistencyType::Balance, address, &previous, &account.balance.to_string()).await?;
        self.metrics.counter("recovery_balance_corrections_total").inc();
        Ok(())
    }

    async fn remediate_nonce(&self, record: &InconsistencyRecord) -> RecoveryResult<()> {
        let address = &record.subject_id;
        let mut account = self.store.get_account(address).await?;
        let previous = account.nonce.to_string();

        let sent = self.store.confirmed_transactions_for_sender(address).await?;
        let expected_nonce = sent.iter().map(|t| t.nonce + 1).max().unwrap_or(0);
        account.nonce = expected_nonce;
        account.last_updated = Utc::now();
        self.store.upsert_account(&account).await?;

        self.audit(InconsistencyType::Nonce, address, &previous, &account.nonce.to_string()).await?;
        self.metrics.counter("recovery_nonce_corrections_total").inc();
        Ok(())
    }

    /// Three-way layer-1/layer-2 reconciliation for a single transaction
    /// (spec.md §4.6), re-deriving the chain's current status rather than
    /// trusting the detector's snapshot (a requeue in a prior cycle may
    /// already have moved the transaction on):
    /// - L1=confirmed ∧ L2≠confirmed → stamp L2 confirmed (processed).
    /// - L1≠confirmed ∧ L2=confirmed → mark for reprocessing: requeue with
    ///   `retry_count` incremented.
    /// - L1=failed ∧ L2≠failed → stamp L2 errored.
    async fn remediate_transaction(&self, record: &InconsistencyRecord) -> RecoveryResult<()> {
        let tx_id = &record.subject_id;
        let Some(tx) = self.store.get_transaction(tx_id).await? else {
            return Ok(());
        };
        let Some(batch_id) = tx.batch_id.clone() else {
            return Ok(());
        };
        let Some(batch) = self.store.get_batch(&batch_id).await? else {
            return Ok(());
        };
        let Ok(Some(l1_status)) = self.client.batch_status(&batch.merkle_root).await else {
            return Ok(());
        };

        let previous = format!("{:?}", tx.status);

        if l1_status == L1TxStatus::Confirmed && tx.status != TransactionStatus::Processed {
            self.store.update_transactions_status(&[tx_id.clone()], TransactionStatus::Processed, None).await?;
            self.audit(InconsistencyType::Transaction, tx_id, &previous, "processed").await?;
            self.metrics.counter("recovery_transaction_confirmed_total").inc();
        } else if l1_status != L1TxStatus::Confirmed && tx.status == TransactionStatus::Processed {
            let Some(requeued) = self.store.requeue_transaction(tx_id).await? else {
                return Ok(());
            };
            self.queue.enqueue(requeued);
            self.audit(InconsistencyType::Transaction, tx_id, &previous, "pending_reprocessing").await?;
            self.metrics.counter("recovery_transaction_requeues_total").inc();
        } else if l1_status == L1TxStatus::Failed && tx.status != TransactionStatus::Errored {
            self.store
                .update_transactions_status(&[tx_id.clone()], TransactionStatus::Errored, Some("layer-1 reported failed".to_string()))
                .await?;
            self.audit(InconsistencyType::Transaction, tx_id, &previous, "errored").await?;
            self.metrics.counter("recovery_transaction_failed_total").inc();
        }
        Ok(())
    }

    /// Marks a stuck batch errored and requeues every member transaction.
    async fn remediate_sequencer_state(&self, record: &InconsistencyRecord) -> RecoveryResult<()> {
        let batch_id = &record.subject_id;
        let Some(batch) = self.store.get_batch(batch_id).await? else {
            return Ok(());
        };
        self.store
            .update_batch_status(batch_id, BatchStatus::Errored, None, Some("recovered: stuck in Submitted".to_string()))
            .await?;
        for tx_id in &batch.transaction_ids {
            if let Some(requeued) = self.store.requeue_transaction(tx_id).await? {
                self.queue.enqueue(requeued);
            }
        }
        self.stuck_batch_candidates.lock().remove(batch_id);
        self.audit(InconsistencyType::SequencerState, batch_id, "submitted", "errored_and_requeued").await?;
        self.metrics.counter("recovery_stuck_batches_requeued_total").inc();
        Ok(())
    }

    /// No automated remediation: a persistently open circuit to the
    /// external chain is an operational alert, not something a retry loop
    /// should paper over.
    async fn remediate_bridge_state(&self, record: &InconsistencyRecord) -> RecoveryResult<()> {
        log::error!(target: "recovery", "bridge state alert: {}", record.details);
        self.metrics.counter("recovery_bridge_alerts_total").inc();
        self.audit(InconsistencyType::BridgeState, &record.subject_id, "open", "alert_raised").await
    }

    async fn audit(&self, subject_type: InconsistencyType, subject_id: &str, previous: &str, new: &str) -> RecoveryResult<()> {
        self.store
            .insert_audit_record(AuditRecord {
                id: Uuid::new_v4().to_string(),
                subject_type,
                subject_id: subject_id.to_string(),
                previous_value: previous.to_string(),
                new_value: new.to_string(),
                recorded_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Spawns the periodic detect-and-remediate loop. `tracked_addresses`
    /// and `watched_batches` are re-read from the closures each tick so
    /// callers can back them with a live view (e.g. every address seen in
    /// the last N confirmed batches) rather than a fixed snapshot.
    pub fn spawn_background_tasks<F, G>(
        self: &Arc<Self>,
        addresses_provider: F,
        batches_provider: G,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> Vec<String> + Send + Sync + 'static,
        G: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        let engine = Arc::clone(self);
        let interval = Duration::from_millis(self.config.check_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let addresses = addresses_provider();
                let batches = batches_provider();
                if let Err(e) = engine.run_cycle(&addresses, &batches).await {
                    log::error!(target: "recovery", "recovery cycle failed: {e}");
                }
            }
        })
    }
}
