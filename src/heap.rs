//! Indexed binary max-heap: `peek`, `extract_max`, `insert`,
//! `update_priority`, `remove`, `contains` in O(log n), with O(1)
//! `contains`/`peek(id)` via a side index map from id to array position.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::HeapEntry;

struct Node<T> {
    entry: HeapEntry<T>,
    /// Monotonic insertion sequence, the tie-break below priority and
    /// timestamp so ordering never depends on hash-map iteration.
    seq: u64,
}

/// Array-backed max-heap ordered by `(priority desc, seq asc)` — later
/// insertions never jump ahead of earlier ones at equal priority.
pub struct IndexedHeap<T> {
    nodes: Vec<Node<T>>,
    index: HashMap<String, usize>,
    next_seq: u64,
}

impl<T> Default for IndexedHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IndexedHeap<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn peek(&self, id: &str) -> Option<&HeapEntry<T>> {
        self.index.get(id).map(|&i| &self.nodes[i].entry)
    }

    pub fn peek_highest(&self) -> Option<&HeapEntry<T>> {
        self.nodes.first().map(|n| &n.entry)
    }

    /// Inserts a new entry, assigning the next insertion-order tie-break
    /// sequence. Returns `false` without mutating if `id` already exists.
    pub fn insert(&mut self, id: String, priority: f64, timestamp: DateTime<Utc>, payload: T) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let i = self.nodes.len();
        self.index.insert(id.clone(), i);
        self.nodes.push(Node {
            entry: HeapEntry {
                id,
                priority,
                timestamp,
                payload,
            },
            seq,
        });
        self.sift_up(i);
        true
    }

    /// Removes and returns the highest-priority entry.
    pub fn extract_max(&mut self) -> Option<HeapEntry<T>> {
        if self.nodes.is_empty() {
            return None;
        }
        let last = self.nodes.len() - 1;
        self.swap_nodes(0, last);
        let node = self.nodes.pop().unwrap();
        self.index.remove(&node.entry.id);
        if !self.nodes.is_empty() {
            self.sift_down(0);
        }
        Some(node.entry)
    }

    /// Removes an arbitrary entry by id.
    pub fn remove(&mut self, id: &str) -> Option<HeapEntry<T>> {
        let i = *self.index.get(id)?;
        let last = self.nodes.len() - 1;
        self.swap_nodes(i, last);
        let node = self.nodes.pop().unwrap();
        self.index.remove(&node.entry.id);
        if i < self.nodes.len() {
            // Re-establish order from the slot the removed entry vacated:
            // it may need to move in either direction.
            self.sift_down(i);
            self.sift_up(i);
        }
        Some(node.entry)
    }

    /// Replaces an entry's priority, re-heapifying from its position.
    pub fn update_priority(&mut self, id: &str, new_priority: f64) -> bool {
        let Some(&i) = self.index.get(id) else {
            return false;
        };
        let old_priority = self.nodes[i].entry.priority;
        self.nodes[i].entry.priority = new_priority;
        if new_priority > old_priority {
            self.sift_up(i);
        } else if new_priority < old_priority {
            self.sift_down(i);
        }
        true
    }

    fn cmp_nodes(&self, a: usize, b: usize) -> std::cmp::Ordering {
        self.nodes[a]
            .entry
            .priority
            .partial_cmp(&self.nodes[b].entry.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.nodes[b].seq.cmp(&self.nodes[a].seq))
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.nodes.swap(a, b);
        self.index.insert(self.nodes[a].entry.id.clone(), a);
        self.index.insert(self.nodes[b].entry.id.clone(), b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.cmp_nodes(i, parent) == std::cmp::Ordering::Greater {
                self.swap_nodes(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.nodes.len();
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut largest = i;
            if left < n && self.cmp_nodes(left, largest) == std::cmp::Ordering::Greater {
                largest = left;
            }
            if right < n && self.cmp_nodes(right, largest) == std::cmp::Ordering::Greater {
                largest = right;
            }
            if largest == i {
                break;
            }
            self.swap_nodes(i, largest);
            i = largest;
        }
    }

    /// Drains up to `n` highest-priority entries, in decreasing priority
    /// order.
    pub fn drain_top(&mut self, n: usize) -> Vec<HeapEntry<T>> {
        let mut out = Vec::with_capacity(n.min(self.nodes.len()));
        for _ in 0..n {
            match self.extract_max() {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        out
    }

    /// Applies `scorer` to every entry and, where it returns `Some(p)`,
    /// rewrites the entry's priority to `p`. Rebuilds heap order once at the
    /// end rather than after each change, since array positions are
    /// untouched by a priority rewrite alone (only heap *order* changes).
    pub fn apply_aging<F>(&mut self, mut scorer: F)
    where
        F: FnMut(&HeapEntry<T>) -> Option<f64>,
    {
        let mut changed = false;
        for node in &mut self.nodes {
            if let Some(new_priority) = scorer(&node.entry) {
                node.entry.priority = new_priority;
                changed = true;
            }
        }
        if changed {
            self.rebuild_heap();
        }
    }

    /// Returns a snapshot of every entry currently in the heap, in no
    /// particular order. Used by aging and by diagnostics.
    pub fn snapshot(&self) -> Vec<&HeapEntry<T>> {
        self.nodes.iter().map(|n| &n.entry).collect()
    }

    fn rebuild_heap(&mut self) {
        let n = self.nodes.len();
        for i in (0..n / 2).rev() {
            self.sift_down(i);
        }
    }

    /// Checks the max-heap invariant and index-map consistency; used by
    /// property tests.
    #[cfg(test)]
    fn check_invariants(&self) {
        for i in 0..self.nodes.len() {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            if left < self.nodes.len() {
                assert_ne!(self.cmp_nodes(left, i), std::cmp::Ordering::Greater);
            }
            if right < self.nodes.len() {
                assert_ne!(self.cmp_nodes(right, i), std::cmp::Ordering::Greater);
            }
        }
        for (id, &i) in self.index.iter() {
            assert_eq!(&self.nodes[i].entry.id, id);
        }
        assert_eq!(self.index.len(), self.nodes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn extracts_in_decreasing_priority_order() {
        let mut heap = IndexedHeap::new();
        for (id, p) in [("a", 1.0), ("b", 5.0), ("c", 3.0), ("d", 4.0)] {
            heap.insert(id.to_string(), p, now(), ());
        }
        let mut order = Vec::new();
        while let Some(e) = heap.extract_max() {
            order.push(e.id);
        }
        assert_eq!(order, vec!["b", "d", "c", "a"]);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut heap = IndexedHeap::new();
        heap.insert("first".to_string(), 1.0, now(), ());
        heap.insert("second".to_string(), 1.0, now(), ());
        heap.insert("third".to_string(), 1.0, now(), ());
        let mut order = Vec::new();
        while let Some(e) = heap.extract_max() {
            order.push(e.id);
        }
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn update_priority_reorders() {
        let mut heap = IndexedHeap::new();
        heap.insert("a".to_string(), 1.0, now(), ());
        heap.insert("b".to_string(), 2.0, now(), ());
        heap.update_priority("a", 10.0);
        assert_eq!(heap.peek_highest().unwrap().id, "a");
        heap.check_invariants();
    }

    #[test]
    fn remove_preserves_invariants() {
        let mut heap = IndexedHeap::new();
        for i in 0..20 {
            heap.insert(format!("id{i}"), (i as f64) % 7.0, now(), ());
        }
        heap.check_invariants();
        heap.remove("id5");
        heap.check_invariants();
        assert!(!heap.contains("id5"));
    }

    #[test]
    fn contains_and_peek_are_o1_lookups() {
        let mut heap = IndexedHeap::new();
        heap.insert("only".to_string(), 1.0, now(), "payload");
        assert!(heap.contains("only"));
        assert_eq!(heap.peek("only").unwrap().payload, "payload");
        assert!(!heap.contains("missing"));
    }

    #[test]
    fn empty_heap_extract_returns_none() {
        let mut heap: IndexedHeap<()> = IndexedHeap::new();
        assert_eq!(heap.extract_max().map(|e| e.id), None);
    }

    proptest::proptest! {
        #[test]
        fn invariants_hold_after_arbitrary_ops(ops in proptest::collection::vec(0..4u8, 0..200)) {
            let mut heap: IndexedHeap<()> = IndexedHeap::new();
            let mut next_id = 0u64;
            for op in ops {
                match op {
                    0 => {
                        let id = format!("id{next_id}");
                        next_id += 1;
                        heap.insert(id, (next_id % 17) as f64, Utc::now(), ());
                    }
                    1 => {
                        heap.extract_max();
                    }
                    2 => {
                        if next_id > 0 {
                            let target = format!("id{}", next_id.saturating_sub(1));
                            heap.update_priority(&target, (next_id % 13) as f64);
                        }
                    }
                    _ => {
                        if next_id > 0 {
                            let target = format!("id{}", next_id.saturating_sub(1));
                            heap.remove(&target);
                        }
                    }
                }
                heap.check_invariants();
            }
        }
    }
}
