//! Predictive prefetcher: an n-gram access-pattern map from "the last N-1
//! keys accessed" to "which key came next, how often", blended with global
//! frequency and temporal-proximity signals into a single hybrid score.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::PrefetchConfig;

#[derive(Default)]
struct PatternStats {
    next_key_counts: HashMap<String, u64>,
    total: u64,
}

/// Accumulates access patterns and scores candidate next-keys with a hybrid
/// of sequence, frequency, and recency signals.
pub struct Prefetcher {
    config: PrefetchConfig,
    history: Mutex<VecDeque<String>>,
    pattern_map: DashMap<Vec<String>, PatternStats>,
    global_freq: DashMap<String, u64>,
    last_seen: DashMap<String, DateTime<Utc>>,
}

impl Prefetcher {
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            config,
            history: Mutex::new(VecDeque::new()),
            pattern_map: DashMap::new(),
            global_freq: DashMap::new(),
            last_seen: DashMap::new(),
        }
    }

    /// Records an access, completing the n-gram pattern that preceded it
    /// (if the history is already long enough) and updating the global
    /// frequency / recency signals.
    pub fn record_access(&self, key: &str, now: DateTime<Utc>) {
        let pattern_len = self.config.pattern_length;
        let mut history = self.history.lock();

        if history.len() >= pattern_len {
            let pattern: Vec<String> = history.iter().rev().take(pattern_len).rev().cloned().collect();
            let mut stats = self.pattern_map.entry(pattern).or_default();
            *stats.next_key_counts.entry(key.to_string()).or_insert(0) += 1;
            stats.total += 1;
        }

        history.push_back(key.to_string());
        while history.len() > pattern_len {
            history.pop_front();
        }
        drop(history);

        *self.global_freq.entry(key.to_string()).or_insert(0) += 1;
        self.last_seen.insert(key.to_string(), now);
    }

    /// Scores every candidate key ever seen as a successor of the current
    /// pattern (or anywhere in the global frequency table) and returns the
    /// top `max_prefetch_items` whose combined score clears `threshold`.
    pub fn candidates(&self, now: DateTime<Utc>) -> Vec<String> {
        if !self.config.enabled {
            return Vec::new();
        }

        let pattern_len = self.config.pattern_length;
        let history = self.history.lock();
        if history.len() < pattern_len {
            return Vec::new();
        }
        let pattern: Vec<String> = history.iter().rev().take(pattern_len).rev().cloned().collect();
        drop(history);

        let Some(stats) = self.pattern_map.get(&pattern) else {
            return Vec::new();
        };

        let max_global = self.global_freq.iter().map(|e| *e.value()).max().unwrap_or(1).max(1);

        let mut scored: Vec<(String, f64)> = stats
            .next_key_counts
            .iter()
            .map(|(candidate, count)| {
                let sequence_score = if stats.total > 0 {
                    *count as f64 / stats.total as f64
                } else {
                    0.0
                };
                let global_score = self
                    .global_freq
                    .get(candidate)
                    .map(|c| *c as f64 / max_global as f64)
                    .unwrap_or(0.0);
                let temporal_score = self
                    .last_seen
                    .get(candidate)
                    .map(|ts| {
                        let age_secs = (now - *ts).num_milliseconds().max(0) as f64 / 1000.0;
                        1.0 / (1.0 + age_secs)
                    })
                    .unwrap_or(0.0);

                let combined = self.config.sequence_weight * sequence_score
                    + self.config.frequency_weight * global_score
                    + self.config.temporal_weight * temporal_score;
                (candidate.clone(), combined)
            })
            .filter(|(_, score)| *score >= self.config.threshold)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.config.max_items);
        scored.into_iter().map(|(k, _)| k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PrefetchConfig {
        PrefetchConfig {
            enabled: true,
            threshold: 0.1,
            pattern_length: 2,
            max_items: 5,
            sequence_weight: 0.5,
            frequency_weight: 0.3,
            temporal_weight: 0.2,
        }
    }

    #[test]
    fn learns_sequence_and_predicts_next_key() {
        let prefetcher = Prefetcher::new(config());
        let now = Utc::now();
        for _ in 0..5 {
            prefetcher.record_access("a", now);
            prefetcher.record_access("b", now);
            prefetcher.record_access("c", now);
        }
        // History now ends in [b, c]; pattern [a, b] -> c was learned, but
        // the live trailing pattern is [b, c] -> predicts the next "a".
        let candidates = prefetcher.candidates(now);
        assert!(candidates.contains(&"a".to_string()));
    }

    #[test]
    fn short_history_yields_no_candidates() {
        let prefetcher = Prefetcher::new(config());
        let now = Utc::now();
        prefetcher.record_access("only-one", now);
        assert!(prefetcher.candidates(now).is_empty());
    }

    #[test]
    fn disabled_prefetcher_returns_nothing() {
        let mut cfg = config();
        cfg.enabled = false;
        let prefetcher = Prefetcher::new(cfg);
        let now = Utc::now();
        prefetcher.record_access("a", now);
        prefetcher.record_access("b", now);
        prefetcher.record_access("c", now);
        assert!(prefetcher.candidates(now).is_empty());
    }
}
