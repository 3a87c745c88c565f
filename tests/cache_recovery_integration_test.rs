//! Cross-component scenarios: cache dependency-graph invalidation (spec.md
//! §8 scenario 3) and a full batch-failure-then-recovery pipeline running
//! the sequencer, worker pool, and recovery engine together (scenario 4).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use l2_engine::cache::{CacheConfig, MultiLevelCache, SetOptions, ShardedBackend, SledBackend};
use l2_engine::client::{BlockchainClient, ClientError, ClientResult, ExternalClient, SubmitReceipt};
use l2_engine::config::{CircuitBreakerConfig, PrefetchConfig, QueueConfig, RecoveryConfig};
use l2_engine::metrics::MetricRegistry;
use l2_engine::model::{TransactionStatus, TransactionType};
use l2_engine::queue::PriorityQueue;
use l2_engine::recovery::RecoveryEngine;
use l2_engine::sequencer::{BatchPreparationHandler, TransactionInput};
use l2_engine::store::{InMemoryStore, StoreClient};
use l2_engine::workers::{Task, TaskHandler, TaskPayload};

fn cache() -> MultiLevelCache {
    MultiLevelCache::new(
        CacheConfig::default(),
        Arc::new(SledBackend::new_temp()),
        Arc::new(ShardedBackend::new(4)),
        PrefetchConfig::default(),
    )
}

#[tokio::test]
async fn invalidating_a_dependency_misses_every_dependent_key() {
    let cache = cache();

    cache.set("a", &"A-value".to_string(), SetOptions { ttl_override_secs: None, dependencies: vec!["b".to_string()] }).await.unwrap();
    cache.set("c", &"C-value".to_string(), SetOptions { ttl_override_secs: None, dependencies: vec!["a".to_string()] }).await.unwrap();

    let (hit, _level) = cache.get::<String>("a").await;
    assert_eq!(hit.as_deref(), Some("A-value"));

    // "a" depends on "b" and "c" depends on "a"; invalidating everything that
    // (transitively) depends on "b" must reach both "a" and "c", then "b" itself.
    cache.invalidate_dependents("b").await;

    let (a_after, _) = cache.get::<String>("a").await;
    let (c_after, _) = cache.get::<String>("c").await;
    let (b_after, _) = cache.get::<String>("b").await;

    assert!(a_after.is_none(), "invalidating a dependency must miss the dependent key");
    assert!(c_after.is_none(), "invalidation must recurse transitively through the dependency graph");
    assert!(b_after.is_none());
}

struct FlakyOnceThenSucceeds {
    failed_already: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl BlockchainClient for FlakyOnceThenSucceeds {
    async fn submit_batch(&self, _bytes: Vec<u8>, merkle_root: &str) -> ClientResult<SubmitReceipt> {
        if !self.failed_already.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(ClientError::Rpc("simulated rpc outage".into()));
        }
        Ok(SubmitReceipt { signature: format!("sig-{merkle_root}") })
    }
}

/// Submit batch B1, have the RPC fail, and confirm the transactions and
/// batch land in `errored`. Then resubmit the same transactions directly
/// through the handler (standing in for the recovery engine's "mark for
/// reprocessing" path) and confirm they land `processed` under a fresh
/// batch while B1 itself remains errored history, per spec.md §8 scenario 4.
#[tokio::test]
async fn failed_batch_is_reconciled_by_a_second_submission() {
    let store: Arc<dyn StoreClient> = Arc::new(InMemoryStore::new());
    let (queue, _rx) = PriorityQueue::new(QueueConfig::default(), None);
    let client = Arc::new(ExternalClient::new(
        Arc::new(FlakyOnceThenSucceeds { failed_already: std::sync::atomic::AtomicBool::new(false) }),
        CircuitBreakerConfig::default(),
    ));
    let handler = BatchPreparationHandler::new(
        Arc::clone(&store),
        Arc::clone(&client),
        Arc::clone(&queue),
        Arc::new(cache()),
        MetricRegistry::new(),
        4,
        1024,
        l2_engine::config::CompressionAlgorithm::Deflate,
    );

    let mut txs = Vec::new();
    for i in 0..50 {
        let tx = TransactionInput {
            sender: format!("sender-{i}"),
            recipient: "pool".to_string(),
            amount: 5,
            nonce: 0,
            expiry_timestamp: Utc::now() + chrono::Duration::hours(1),
            transaction_type: TransactionType::Transfer,
            data: vec![],
            signature: vec![],
            fee: 1,
        };
        let tx = {
            // build the same way Sequencer::add_transaction would, without going
            // through validation/dedup (out of scope for this handler-level test)
            let t = l2_engine::model::Transaction {
                id: String::new(),
                sender: tx.sender,
                recipient: tx.recipient,
                amount: tx.amount,
                nonce: tx.nonce,
                expiry_timestamp: tx.expiry_timestamp,
                transaction_type: tx.transaction_type,
                data: tx.data,
                signature: tx.signature,
                status: TransactionStatus::Pending,
                created_at: Utc::now(),
                processed_at: None,
                batch_id: None,
                error: None,
                priority: 0.0,
                retry_count: 0,
                fee: tx.fee,
            };
            t.with_generated_id()
        };
        store.insert_transaction(&tx).await.unwrap();
        txs.push(tx);
    }

    let task1 = Task::new(
        TaskPayload::BatchPreparation { batch_id: "b1".into(), transactions: txs.clone() },
        1.0,
        Duration::from_secs(5),
    );
    assert!(handler.handle(&task1).await.is_err());

    for tx in &txs {
        let stored = store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Errored);
    }

    // Resubmit the same 50 transactions as a fresh batch (B1 stays errored history).
    let requeued: Vec<_> = futures::future::join_all(txs.iter().map(|tx| store.requeue_transaction(&tx.id)))
        .await
        .into_iter()
        .filter_map(|r| r.unwrap())
        .collect();
    assert_eq!(requeued.len(), 50);

    let task2 = Task::new(
        TaskPayload::BatchPreparation { batch_id: "b2".into(), transactions: requeued.clone() },
        1.0,
        Duration::from_secs(5),
    );
    handler.handle(&task2).await.unwrap();

    for tx in &requeued {
        let stored = store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Processed);
        assert_eq!(stored.retry_count, 1);
    }

    let b1 = store.get_batch("b1").await.unwrap().unwrap();
    assert_eq!(b1.status, l2_engine::model::BatchStatus::Errored);
}

/// Recovery's nonce detector overwrites a stale stored nonce with the value
/// recomputed from confirmed history, and is idempotent on a second run
/// (spec.md §8 scenario 6).
#[tokio::test]
async fn nonce_detector_corrects_stale_stored_nonce_and_is_idempotent() {
    let store: Arc<dyn StoreClient> = Arc::new(InMemoryStore::new());
    let (queue, _rx) = PriorityQueue::new(QueueConfig::default(), None);

    for nonce in 0..=4u64 {
        let tx = l2_engine::model::Transaction {
            id: format!("confirmed-{nonce}"),
            sender: "alice".to_string(),
            recipient: "bob".to_string(),
            amount: 1,
            nonce,
            expiry_timestamp: Utc::now() + chrono::Duration::hours(1),
            transaction_type: TransactionType::Transfer,
            data: vec![],
            signature: vec![],
            status: TransactionStatus::Processed,
            created_at: Utc::now(),
            processed_at: Some(Utc::now()),
            batch_id: Some("b1".into()),
            error: None,
            priority: 0.0,
            retry_count: 0,
            fee: 1,
        };
        store.insert_transaction(&tx).await.unwrap();
    }

    // stale stored nonce of 7, ground truth from confirmed history is 5 (max nonce 4 + 1)
    let mut account = store.get_account("alice").await.unwrap();
    account.nonce = 7;
    store.upsert_account(&account).await.unwrap();

    let client = Arc::new(ExternalClient::new(
        Arc::new(FlakyOnceThenSucceeds { failed_already: std::sync::atomic::AtomicBool::new(true) }),
        CircuitBreakerConfig::default(),
    ));
    let recovery = RecoveryEngine::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        client,
        MetricRegistry::new(),
        RecoveryConfig { check_interval_ms: 30_000, max_attempts: 3 },
    );

    let report1 = recovery.run_cycle(&["alice".to_string()], &[]).await.unwrap();
    assert!(report1.detected >= 1);
    assert_eq!(store.get_account("alice").await.unwrap().nonce, 5);

    let report2 = recovery.run_cycle(&["alice".to_string()], &[]).await.unwrap();
    assert_eq!(report2.detected, 0, "re-running the detector against corrected state must find nothing");
    assert_eq!(store.get_account("alice").await.unwrap().nonce, 5);
}
