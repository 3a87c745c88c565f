//! Deterministic merkle root computation over a batch's ordered transaction
//! leaf hashes.

use crate::model::Transaction;

/// Computes the merkle root over `transactions` in insertion order, with a
/// stable tie-break by transaction id (applied only when two leaves hash
/// identically, which cannot happen for distinct canonical byte layouts but
/// keeps the ordering deterministic even on degenerate input).
pub fn merkle_root(transactions: &[Transaction]) -> String {
    if transactions.is_empty() {
        return hex::encode(blake3::hash(&[]).as_bytes());
    }

    let mut leaves: Vec<[u8; 32]> = transactions
        .iter()
        .map(|t| *t.content_hash().as_bytes())
        .collect();

    // Leaves already carry insertion order; only break ties on identical
    // hashes so the final root never depends on HashMap/iteration order.
    let mut indices: Vec<usize> = (0..leaves.len()).collect();
    indices.sort_by(|&a, &b| {
        leaves[a]
            .cmp(&leaves[b])
            .then_with(|| transactions[a].id.cmp(&transactions[b].id))
    });
    // Stable tie-break only matters among equal-hash leaves; otherwise
    // preserve original order.
    if leaves.windows(2).all(|w| w[0] != w[1]) {
        // no duplicate hashes, keep original order
    } else {
        leaves = indices.into_iter().map(|i| leaves[i]).collect();
    }

    let mut level = leaves;
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&pair[0]);
            if pair.len() == 2 {
                hasher.update(&pair[1]);
            } else {
                // Odd node out: duplicate it, the conventional merkle-tree
                // padding rule.
                hasher.update(&pair[0]);
            }
            next.push(*hasher.finalize().as_bytes());
        }
        level = next;
    }

    hex::encode(level[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TransactionStatus, TransactionType};
    use chrono::Utc;

    fn tx(id: &str, sender: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            sender: sender.to_string(),
            recipient: "recipient".into(),
            amount: 1,
            nonce: 0,
            expiry_timestamp: Utc::now(),
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

    #[test]
    fn deterministic_for_same_ordered_set() {
        let txs = vec![tx("a", "s1"), tx("b", "s2"), tx("c", "s3")];
        let r1 = merkle_root(&txs);
        let r2 = merkle_root(&txs);
        assert_eq!(r1, r2);
    }

    #[test]
    fn different_order_changes_root_unless_hashes_tie() {
        let txs_a = vec![tx("a", "s1"), tx("b", "s2")];
        let mut txs_b = txs_a.clone();
        txs_b.swap(0, 1);
        assert_ne!(merkle_root(&txs_a), merkle_root(&txs_b));
    }

    #[test]
    fn empty_batch_has_stable_root() {
        assert_eq!(merkle_root(&[]), merkle_root(&[]));
    }

    #[test]
    fn single_transaction_root_is_its_own_hash() {
        let txs = vec![tx("solo", "s1")];
        let expected = hex::encode(txs[0].content_hash().as_bytes());
        assert_eq!(merkle_root(&txs), expected);
    }
}
