//! End-to-end priority-queue scenarios mirroring the fee-ordering and aging
//! guarantees the heap and queue together must provide.

use chrono::Utc;
use l2_engine::config::QueueConfig;
use l2_engine::model::{Transaction, TransactionStatus, TransactionType};
use l2_engine::queue::PriorityQueue;

fn tx(id: &str, fee: u64) -> Transaction {
    Transaction {
        id: id.to_string(),
        sender: format!("sender-{id}"),
        recipient: "bob".to_string(),
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
fn dequeue_returns_highest_fee_transactions_in_decreasing_order() {
    let (queue, _rx) = PriorityQueue::new(QueueConfig::default(), None);

    for fee in 100..400u64 {
        assert!(queue.enqueue(tx(&format!("tx-{fee}"), fee)));
    }
    assert_eq!(queue.size(), 300);

    let top = queue.dequeue(100);
    assert_eq!(top.len(), 100);

    let fees: Vec<u64> = top.iter().map(|t| t.fee).collect();
    let mut sorted_desc = fees.clone();
    sorted_desc.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(fees, sorted_desc, "dequeue must return entries in decreasing priority order");

    // fee dominates the score (weight 0.5 vs 0.1 for size/sender), so the
    // top 100 by fee [300..399] should be exactly what came out.
    let mut expected: Vec<u64> = (300..400).collect();
    expected.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(fees, expected);

    assert_eq!(queue.size(), 200);
}

#[test]
fn equal_priority_entries_preserve_insertion_order_under_aging() {
    let mut config = QueueConfig::default();
    config.aging_interval_ms = 1;
    config.aging_factor = 1.1;
    let (queue, _rx) = PriorityQueue::new(config, None);

    for i in 0..10 {
        let mut t = tx(&format!("eq-{i}"), 200);
        t.created_at = Utc::now() - chrono::Duration::seconds(60);
        assert!(queue.enqueue(t));
    }

    let before: Vec<f64> = (0..10).filter_map(|i| queue.peek(&format!("eq-{i}")).map(|t| t.priority)).collect();

    queue.apply_aging(Utc::now());

    let after: Vec<f64> = (0..10).filter_map(|i| queue.peek(&format!("eq-{i}")).map(|t| t.priority)).collect();

    for (b, a) in before.iter().zip(after.iter()) {
        assert!(*a >= *b, "aging must never lower priority");
        assert!(*a <= b * 1.1 + 1e-6, "aging must not exceed the configured factor in one pass");
    }

    let drained: Vec<String> = queue.dequeue(10).into_iter().map(|t| t.id).collect();
    let expected_order: Vec<String> = (0..10).map(|i| format!("eq-{i}")).collect();
    assert_eq!(drained, expected_order, "ties must break by insertion order");
}

#[test]
fn backpressure_rejects_at_high_watermark_and_recovers_at_low_watermark() {
    let mut config = QueueConfig::default();
    config.max_queue_size = 10;
    config.high_watermark = 0.8;
    config.low_watermark = 0.5;
    let (queue, _rx) = PriorityQueue::new(config, None);

    for i in 0..8 {
        assert!(queue.enqueue(tx(&format!("bp-{i}"), 100 + i)));
    }
    // ninth enqueue crosses high watermark (8/10 == 0.8) and should start rejecting.
    assert!(!queue.enqueue(tx("bp-rejected", 500)));
    assert!(queue.dropped_count() >= 1);

    queue.dequeue(5);
    // size is now 3/10 == 0.3, below the low watermark: backpressure clears.
    assert!(queue.enqueue(tx("bp-accepted", 500)));
}
