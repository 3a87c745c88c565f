//! `sqlx`/SQLite-backed [`StoreClient`], grounded in the teacher's
//! `database::connection_pool::ConnectionPool` pool-construction pattern
//! (WAL mode, busy timeout, bounded min/max connections) and
//! `database::migrations`'s migration discipline — here via `sqlx::migrate!`
//! rather than the teacher's own hand-rolled `Migration` trait, since
//! `sqlx` already ships that machinery and the teacher's corpus uses
//! `sqlx::migrate!` elsewhere for the same purpose.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::model::{Account, Batch, BatchStatus, Transaction, TransactionStatus, TransactionType};
use crate::store::{AuditRecord, StoreClient, StoreError, StoreResult};

/// Connection-pooled SQLite store.
pub struct SqlxStore {
    pool: SqlitePool,
}

impl SqlxStore {
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { pool })
    }

    fn row_to_transaction(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Transaction> {
        let status_code: i64 = row.try_get("status").map_err(db_err)?;
        let type_code: i64 = row.try_get("transaction_type").map_err(db_err)?;
        Ok(Transaction {
            id: row.try_get("id").map_err(db_err)?,
            sender: row.try_get("sender").map_err(db_err)?,
            recipient: row.try_get("recipient").map_err(db_err)?,
            amount: row.try_get::<i64, _>("amount").map_err(db_err)? as u64,
            nonce: row.try_get::<i64, _>("nonce").map_err(db_err)? as u64,
            expiry_timestamp: row.try_get("expiry_timestamp").map_err(db_err)?,
            transaction_type: TransactionType::try_from(type_code as i16).map_err(StoreError::Serialization)?,
            data: row.try_get("data").map_err(db_err)?,
            signature: row.try_get("signature").map_err(db_err)?,
            status: TransactionStatus::try_from(status_code as i16).map_err(StoreError::Serialization)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            processed_at: row.try_get("processed_at").map_err(db_err)?,
            batch_id: row.try_get("batch_id").map_err(db_err)?,
            error: row.try_get("error").map_err(db_err)?,
            priority: row.try_get("priority").map_err(db_err)?,
            retry_count: row.try_get::<i64, _>("retry_count").map_err(db_err)? as u32,
            fee: row.try_get::<i64, _>("fee").map_err(db_err)? as u64,
        })
    }

    fn row_to_batch(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Batch> {
        let status_code: i64 = row.try_get("status").map_err(db_err)?;
        Ok(Batch {
            id: row.try_get("id").map_err(db_err)?,
            merkle_root: row.try_get("merkle_root").map_err(db_err)?,
            transaction_count: row.try_get::<i64, _>("transaction_count").map_err(db_err)? as usize,
            status: BatchStatus::try_from(status_code as i16).map_err(StoreError::Serialization)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            submitted_at: row.try_get("submitted_at").map_err(db_err)?,
            confirmed_at: row.try_get("confirmed_at").map_err(db_err)?,
            signature: row.try_get("signature").map_err(db_err)?,
            error: row.try_get("error").map_err(db_err)?,
            transaction_ids: Vec::new(),
        })
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

#[async_trait]
impl StoreClient for SqlxStore {
    async fn insert_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        let type_code: i16 = tx.transaction_type.into();
        let status_code: i16 = tx.status.into();
        sqlx::query(
            "INSERT INTO transactions
                (id, sender, recipient, amount, nonce, expiry_timestamp, transaction_type,
                 data, signature, status, created_at, processed_at, batch_id, error,
                 priority, retry_count, fee)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&tx.id)
        .bind(&tx.sender)
        .bind(&tx.recipient)
        .bind(tx.amount as i64)
        .bind(tx.nonce as i64)
        .bind(tx.expiry_timestamp)
        .bind(type_code)
        .bind(&tx.data)
        .bind(&tx.signature)
        .bind(status_code)
        .bind(tx.created_at)
        .bind(tx.processed_at)
        .bind(&tx.batch_id)
        .bind(&tx.error)
        .bind(tx.priority)
        .bind(tx.retry_count as i64)
        .bind(tx.fee as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_transaction(&self, id: &str) -> StoreResult<Option<Transaction>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    async fn pending_transactions(&self, limit: usize) -> StoreResult<Vec<Transaction>> {
        let rows = sqlx::query("SELECT * FROM transactions WHERE status = 0 ORDER BY created_at ASC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn assign_batch(&self, batch: &Batch, tx_ids: &[String]) -> StoreResult<()> {
        let status_code: i16 = batch.status.into();
        let mut txn = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO batches (id, merkle_root, transaction_count, status, created_at, submitted_at, confirmed_at, signature, error)
             VALUES (?,?,?,?,?,?,?,?,?)",
        )
        .bind(&batch.id)
        .bind(&batch.merkle_root)
        .bind(batch.transaction_count as i64)
        .bind(status_code)
        .bind(batch.created_at)
        .bind(batch.submitted_at)
        .bind(batch.confirmed_at)
        .bind(&batch.signature)
        .bind(&batch.error)
        .execute(&mut *txn)
        .await
        .map_err(db_err)?;

        for id in tx_ids {
            let result = sqlx::query("UPDATE transactions SET batch_id = ? WHERE id = ?")
                .bind(&batch.id)
                .bind(id)
                .execute(&mut *txn)
                .await
                .map_err(db_err)?;
            if result.rows_affected() == 0 {
                txn.rollback().await.map_err(db_err)?;
                return Err(StoreError::TransactionNotFound(id.clone()));
            }
        }

        txn.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn update_batch_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        signature: Option<String>,
        error: Option<String>,
    ) -> StoreResult<()> {
        let status_code: i16 = status.into();
        let now = Utc::now();
        let (submitted_at, confirmed_at) = match status {
            BatchStatus::Submitted => (Some(now), None),
            BatchStatus::Confirmed => (None, Some(now)),
            _ => (None, None),
        };

        let result = sqlx::query(
            "UPDATE batches SET status = ?, signature = COALESCE(?, signature), error = ?,
                submitted_at = COALESCE(?, submitted_at), confirmed_at = COALESCE(?, confirmed_at)
             WHERE id = ?",
        )
        .bind(status_code)
        .bind(signature)
        .bind(error)
        .bind(submitted_at)
        .bind(confirmed_at)
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::BatchNotFound(batch_id.to_string()));
        }
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> StoreResult<Option<Batch>> {
        let row = sqlx::query("SELECT * FROM batches WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_batch).transpose()
    }

    async fn update_transactions_status(
        &self,
        tx_ids: &[String],
        status: TransactionStatus,
        error: Option<String>,
    ) -> StoreResult<()> {
        let status_code: i16 = status.into();
        let processed_at = (status == TransactionStatus::Processed).then(Utc::now);
        let mut txn = self.pool.begin().await.map_err(db_err)?;
        for id in tx_ids {
            sqlx::query(
                "UPDATE transactions SET status = ?, error = ?, processed_at = COALESCE(?, processed_at) WHERE id = ?",
            )
            .bind(status_code)
            .bind(&error)
            .bind(processed_at)
            .bind(id)
            .execute(&mut *txn)
            .await
            .map_err(db_err)?;
        }
        txn.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn requeue_transaction(&self, id: &str) -> StoreResult<Option<Transaction>> {
        let pending_code: i16 = TransactionStatus::Pending.into();
        let result = sqlx::query(
            "UPDATE transactions SET status = ?, batch_id = NULL, error = NULL, retry_count = retry_count + 1 WHERE id = ?",
        )
        .bind(pending_code)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_transaction(id).await
    }

    async fn get_account(&self, address: &str) -> StoreResult<Account> {
        let row = sqlx::query("SELECT * FROM accounts WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => Ok(Account {
                address: row.try_get("address").map_err(db_err)?,
                balance: row.try_get::<i64, _>("balance").map_err(db_err)? as i128,
                nonce: row.try_get::<i64, _>("nonce").map_err(db_err)? as u64,
                last_updated: row.try_get("last_updated").map_err(db_err)?,
            }),
            None => Ok(Account {
                address: address.to_string(),
                balance: 0,
                nonce: 0,
                last_updated: Utc::now(),
            }),
        }
    }

    async fn upsert_account(&self, account: &Account) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO accounts (address, balance, nonce, last_updated) VALUES (?,?,?,?)
             ON CONFLICT(address) DO UPDATE SET balance = excluded.balance, nonce = excluded.nonce, last_updated = excluded.last_updated",
        )
        .bind(&account.address)
        .bind(account.balance as i64)
        .bind(account.nonce as i64)
        .bind(account.last_updated)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn confirmed_transactions_for_sender(&self, address: &str) -> StoreResult<Vec<Transaction>> {
        let rows = sqlx::query("SELECT * FROM transactions WHERE sender = ? AND status = 1")
            .bind(address)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn confirmed_transactions_for_recipient(&self, address: &str) -> StoreResult<Vec<Transaction>> {
        let rows = sqlx::query("SELECT * FROM transactions WHERE recipient = ? AND status = 1")
            .bind(address)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn insert_audit_record(&self, mut record: AuditRecord) -> StoreResult<()> {
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        let subject_type = format!("{:?}", record.subject_type);
        sqlx::query(
            "INSERT INTO audit_log (id, subject_type, subject_id, previous_value, new_value, recorded_at)
             VALUES (?,?,?,?,?,?)",
        )
        .bind(&record.id)
        .bind(subject_type)
        .bind(&record.subject_id)
        .bind(&record.previous_value)
        .bind(&record.new_value)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

