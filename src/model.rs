//! Shared data model: transactions, batches, accounts, and the records that
//! flow between the sequencer, recovery engine, and store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of transaction kinds, small enough to store as `SMALLINT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Transfer,
    Mint,
    Burn,
    Swap,
    ContractCall,
}

impl From<TransactionType> for i16 {
    fn from(value: TransactionType) -> Self {
        match value {
            TransactionType::Transfer => 0,
            TransactionType::Mint => 1,
            TransactionType::Burn => 2,
            TransactionType::Swap => 3,
            TransactionType::ContractCall => 4,
        }
    }
}

impl TryFrom<i16> for TransactionType {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TransactionType::Transfer),
            1 => Ok(TransactionType::Mint),
            2 => Ok(TransactionType::Burn),
            3 => Ok(TransactionType::Swap),
            4 => Ok(TransactionType::ContractCall),
            other => Err(format!("unknown transaction_type {other}")),
        }
    }
}

/// Transaction lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Processed,
    Errored,
}

impl From<TransactionStatus> for i16 {
    fn from(value: TransactionStatus) -> Self {
        match value {
            TransactionStatus::Pending => 0,
            TransactionStatus::Processed => 1,
            TransactionStatus::Errored => 3,
        }
    }
}

impl TryFrom<i16> for TransactionStatus {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TransactionStatus::Pending),
            1 => Ok(TransactionStatus::Processed),
            3 => Ok(TransactionStatus::Errored),
            other => Err(format!("unknown transaction status {other}")),
        }
    }
}

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    Submitted,
    Confirmed,
    Errored,
}

impl From<BatchStatus> for i16 {
    fn from(value: BatchStatus) -> Self {
        match value {
            BatchStatus::Pending => 0,
            BatchStatus::Submitted => 1,
            BatchStatus::Confirmed => 2,
            BatchStatus::Errored => 3,
        }
    }
}

impl TryFrom<i16> for BatchStatus {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BatchStatus::Pending),
            1 => Ok(BatchStatus::Submitted),
            2 => Ok(BatchStatus::Confirmed),
            3 => Ok(BatchStatus::Errored),
            other => Err(format!("unknown batch status {other}")),
        }
    }
}

/// A user transaction as it flows through validation, the queue, and a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
    pub nonce: u64,
    pub expiry_timestamp: DateTime<Utc>,
    pub transaction_type: TransactionType,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub batch_id: Option<String>,
    pub error: Option<String>,
    pub priority: f64,
    pub retry_count: u32,
    /// Fee offered by the sender, used by the priority function's `f̂` term.
    pub fee: u64,
}

impl Transaction {
    /// Canonical byte layout hashed for merkle leaves and dedup content
    /// hashes: fixed-width fields in the order `(sender, recipient, amount,
    /// nonce, expiry, type, data)`.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.data.len());
        buf.extend_from_slice(self.sender.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.recipient.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.amount.to_be_bytes());
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.expiry_timestamp.timestamp().to_be_bytes());
        buf.push(i16::from(self.transaction_type) as u8);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Content hash used for batch merkle leaves and sequencer dedup.
    pub fn content_hash(&self) -> blake3::Hash {
        blake3::hash(&self.canonical_bytes())
    }

    pub fn with_generated_id(mut self) -> Self {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        self
    }
}

/// Ordered set of transactions committed together under one merkle root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub merkle_root: String,
    pub transaction_count: usize,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub signature: Option<String>,
    pub error: Option<String>,
    pub transaction_ids: Vec<String>,
}

impl Batch {
    pub fn new(transactions: &[Transaction]) -> Self {
        let merkle_root = crate::merkle::merkle_root(transactions);
        Self {
            id: Uuid::new_v4().to_string(),
            merkle_root,
            transaction_count: transactions.len(),
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            submitted_at: None,
            confirmed_at: None,
            signature: None,
            error: None,
            transaction_ids: transactions.iter().map(|t| t.id.clone()).collect(),
        }
    }
}

/// On-ledger account view maintained from confirmed transaction history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    pub balance: i128,
    pub nonce: u64,
    pub last_updated: DateTime<Utc>,
}

/// Payload carried by an indexed heap entry. `id` and `priority` drive
/// ordering; `payload` is opaque to the heap itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapEntry<T> {
    pub id: String,
    pub priority: f64,
    pub timestamp: DateTime<Utc>,
    pub payload: T,
}

/// Category of a detected layer-1/layer-2 divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InconsistencyType {
    Transaction,
    Balance,
    Nonce,
    SequencerState,
    BridgeState,
}

/// Severity of an `InconsistencyRecord`, used to gate alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Output of a recovery detector, input to the matching strategy. Immutable
/// once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InconsistencyRecord {
    pub record_type: InconsistencyType,
    pub subject_id: String,
    pub details: String,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_type_roundtrips_through_i16() {
        for t in [
            TransactionType::Transfer,
            TransactionType::Mint,
            TransactionType::Burn,
            TransactionType::Swap,
            TransactionType::ContractCall,
        ] {
            let code: i16 = t.into();
            assert_eq!(TransactionType::try_from(code).unwrap(), t);
        }
    }

    #[test]
    fn batch_status_roundtrips_through_i16() {
        for s in [
            BatchStatus::Pending,
            BatchStatus::Submitted,
            BatchStatus::Confirmed,
            BatchStatus::Errored,
        ] {
            let code: i16 = s.into();
            assert_eq!(BatchStatus::try_from(code).unwrap(), s);
        }
    }

    #[test]
    fn canonical_bytes_is_order_sensitive() {
        let base = Transaction {
            id: "t1".into(),
            sender: "alice".into(),
            recipient: "bob".into(),
            amount: 10,
            nonce: 0,
            expiry_timestamp: Utc::now(),
            transaction_type: TransactionType::Transfer,
            data: vec![1, 2, 3],
            signature: vec![],
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            batch_id: None,
            error: None,
            priority: 0.0,
            retry_count: 0,
            fee: 5,
        };
        let mut swapped = base.clone();
        swapped.sender = base.recipient.clone();
        swapped.recipient = base.sender.clone();
        assert_ne!(base.content_hash(), swapped.content_hash());
    }
}
