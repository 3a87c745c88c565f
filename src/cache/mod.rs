//! # Multi-Level Cache
//!
//! Three-tier read-through cache (L1 in-process LRU, L2 shared KV, L3
//! sharded/distributed KV) with dependency-graph invalidation and a
//! predictive prefetcher. Tiers implement one narrow [`CacheBackend`]
//! trait (spec.md §9's "reflection / duck-typed cache backends" note: a
//! single `get/set/delete/keys(prefix)?/close` interface plus a registry of
//! implementations, rather than per-backend special-casing). `keys(prefix)`
//! is optional; a backend that can't enumerate keys returns `None` and the
//! cache skips prefix invalidation for that tier alone.

mod codec;
mod invalidation;
mod prefetch;
mod tier;

pub use codec::{decode, encode, EncodedData, StoredAlgorithm};
pub use invalidation::DependencyGraph;
pub use prefetch::Prefetcher;
pub use tier::{CacheBackend, MokaBackend, RedisBackend, ShardedBackend, SledBackend};

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CacheConfig;

/// Errors surfaced by the multi-level cache's public contract.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("tier unavailable: {0}")]
    TierUnavailable(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Which tier served a read, or that every tier missed. Recorded as a
/// metric by callers (spec.md §4.3 "Latency per tier and hit level are
/// recorded as metrics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitLevel {
    L1,
    L2,
    L3,
    Miss,
}

/// Per-tier error counters for invalidation's fire-and-forget fan-out
/// (spec.md §4.3 "invalidation is fire-and-forget across tiers with
/// per-tier error counters").
#[derive(Debug, Default, Clone, Copy)]
pub struct TierErrorCounters {
    pub l1: u64,
    pub l2: u64,
    pub l3: u64,
}

/// Options accepted by [`MultiLevelCache::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl_override_secs: Option<u64>,
    pub dependencies: Vec<String>,
}

/// On-disk snapshot of L1 plus its dependency edges, written on an
/// interval and reloaded at startup. Best-effort: load errors are counted,
/// never block startup (spec.md §4.3 "Persistence").
#[derive(Debug, Serialize, Deserialize, Default)]
struct Snapshot {
    entries: Vec<(String, EncodedData, Option<i64>)>,
    edges: Vec<(String, Vec<String>)>,
}

/// Orchestrates the three tiers, the dependency graph, and the predictive
/// prefetcher behind spec.md §4.3's read-through/write-through contract.
pub struct MultiLevelCache {
    config: CacheConfig,
    l1: Arc<dyn CacheBackend>,
    l2: Arc<dyn CacheBackend>,
    l3: Arc<dyn CacheBackend>,
    graph: DependencyGraph,
    prefetcher: Prefetcher,
    load_errors: std::sync::atomic::AtomicU64,
}

impl MultiLevelCache {
    /// Builds a cache from config-selected tier backends. `l2`/`l3` are
    /// injected so production wiring (redis-backed L2, sharded L3) and test
    /// wiring (in-memory stand-ins) share one constructor.
    pub fn new(
        config: CacheConfig,
        l2: Arc<dyn CacheBackend>,
        l3: Arc<dyn CacheBackend>,
        prefetch_config: crate::config::PrefetchConfig,
    ) -> Self {
        let l1 = Arc::new(MokaBackend::new(config.l1_max, config.l1_ttl_secs));
        Self {
            config,
            l1,
            l2,
            l3,
            graph: DependencyGraph::new(),
            prefetcher: Prefetcher::new(prefetch_config),
            load_errors: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Probes L1 -> L2 -> L3 in order, promoting on hit (an L3 hit
    /// populates L2 and L1; an L2 hit populates L1 only). Records the
    /// access for the prefetcher regardless of hit/miss.
    pub async fn get<T>(&self, key: &str) -> (Option<T>, HitLevel)
    where
        T: for<'de> Deserialize<'de> + Serialize + Clone,
    {
        self.prefetcher.record_access(key, Utc::now());

        if let Some(encoded) = self.l1.get(key).await {
            if let Ok(value) = decode::<T>(&encoded) {
                return (Some(value), HitLevel::L1);
            }
        }

        if let Some(encoded) = self.l2.get(key).await {
            if let Ok(value) = decode::<T>(&encoded) {
                let _ = self.l1.set(key, encoded, self.config.l1_ttl_secs).await;
                return (Some(value), HitLevel::L2);
            }
        }

        if let Some(encoded) = self.l3.get(key).await {
            if let Ok(value) = decode::<T>(&encoded) {
                let _ = self.l2.set(key, encoded.clone(), self.config.l2_ttl_secs).await;
                let _ = self.l1.set(key, encoded, self.config.l1_ttl_secs).await;
                return (Some(value), HitLevel::L3);
            }
        }

        (None, HitLevel::Miss)
    }

    /// Writes through every tier with its configured TTL and registers
    /// `key -> dep` edges for every entry in `options.dependencies`.
    /// Compresses the encoded value above `compression_threshold`.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, options: SetOptions) -> CacheResult<()> {
        let encoded = encode(value, self.config.compression_threshold, self.config.compression_algorithm)?;

        let l1_ttl = options.ttl_override_secs.unwrap_or(self.config.l1_ttl_secs);
        let l2_ttl = options.ttl_override_secs.unwrap_or(self.config.l2_ttl_secs);
        let l3_ttl = options.ttl_override_secs.unwrap_or(self.config.l3_ttl_secs);

        // Fire-and-forget across tiers: a slow/unavailable tier never
        // blocks the others (spec.md §4.3), but `set`'s own return value
        // reflects whether the authoritative L1 write succeeded.
        let _ = self.l3.set(key, encoded.clone(), l3_ttl).await;
        let _ = self.l2.set(key, encoded.clone(), l2_ttl).await;
        self.l1.set(key, encoded, l1_ttl).await?;

        if !options.dependencies.is_empty() {
            self.graph.register(key, &options.dependencies);
        }

        Ok(())
    }

    /// Removes `key` from every tier.
    pub async fn invalidate(&self, key: &str) -> TierErrorCounters {
        let mut counters = TierErrorCounters::default();
        if self.l1.delete(key).await.is_err() {
            counters.l1 += 1;
        }
        if self.l2.delete(key).await.is_err() {
            counters.l2 += 1;
        }
        if self.l3.delete(key).await.is_err() {
            counters.l3 += 1;
        }
        self.graph.remove_key(key);
        counters
    }

    /// Removes every key that (transitively, up to `max_transitive_depth`)
    /// depends on `key`, then `key` itself.
    pub async fn invalidate_dependents(&self, key: &str) -> TierErrorCounters {
        let dependents = self.graph.transitive_dependents(key, self.config.max_transitive_depth);
        let mut total = TierErrorCounters::default();
        for dependent in &dependents {
            let c = self.invalidate(dependent).await;
            total.l1 += c.l1;
            total.l2 += c.l2;
            total.l3 += c.l3;
        }
        let c = self.invalidate(key).await;
        total.l1 += c.l1;
        total.l2 += c.l2;
        total.l3 += c.l3;
        total
    }

    /// Removes every key starting with `prefix` from every tier that
    /// supports key enumeration; tiers that don't (an unsupported
    /// `keys(prefix)`) are skipped, not errored.
    pub async fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        for tier in [&self.l1, &self.l2, &self.l3] {
            if let Some(keys) = tier.keys_with_prefix(prefix).await {
                for key in keys {
                    if tier.delete(&key).await.is_ok() {
                        removed += 1;
                    }
                    self.graph.remove_key(&key);
                }
            }
        }
        removed
    }

    /// Speculatively fetches the prefetcher's current top candidates via
    /// `loader`, writing hits into L1 only (a prefetch hit is a guess, not
    /// yet a confirmed working set member promoted all the way through).
    pub async fn prefetch<T, F, Fut>(&self, loader: F) -> Vec<String>
    where
        T: Serialize,
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Option<T>>,
    {
        let candidates = self.prefetcher.candidates(Utc::now());
        let mut fetched = Vec::new();
        for key in candidates {
            if let Some(value) = loader(key.clone()).await {
                if let Ok(encoded) = encode(&value, self.config.compression_threshold, self.config.compression_algorithm) {
                    if self.l1.set(&key, encoded, self.config.l1_ttl_secs).await.is_ok() {
                        fetched.push(key);
                    }
                }
            }
        }
        fetched
    }

    pub fn load_error_count(&self) -> u64 {
        self.load_errors.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Serializes L1 contents and dependency edges to a rotating snapshot
    /// file. Best-effort: failures are logged and counted, never
    /// propagated to the caller's control flow.
    pub async fn persist(&self) {
        let Some(entries) = self.l1.snapshot_entries().await else {
            return;
        };
        let edges = self.graph.all_edges();
        let snapshot = Snapshot { entries, edges };

        let bytes = match bincode::serialize(&snapshot) {
            Ok(b) => b,
            Err(_) => {
                self.load_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return;
            }
        };

        let path = self.rotate_path();
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            log::warn!(target: "cache", "persistence write failed for {:?}: {e}", path);
            self.load_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        self.prune_old_snapshots().await;
    }

    /// Loads the most recent snapshot file(s) at startup, skipping expired
    /// entries. Never blocks or fails startup; load errors only increment a
    /// counter.
    pub async fn load_persisted(&self) {
        let dir = PathBuf::from(&self.config.persistence_path);
        let Ok(mut read_dir) = tokio::fs::read_dir(&dir).await else {
            return;
        };
        let mut files = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            files.push(entry.path());
        }
        files.sort();
        let Some(latest) = files.last() else {
            return;
        };

        let Ok(bytes) = tokio::fs::read(latest).await else {
            self.load_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        };
        let Ok(snapshot) = bincode::deserialize::<Snapshot>(&bytes) else {
            self.load_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        };

        let now = Utc::now().timestamp();
        for (key, encoded, expiry) in snapshot.entries {
            if let Some(exp) = expiry {
                if exp <= now {
                    continue;
                }
            }
            let _ = self.l1.set(&key, encoded, self.config.l1_ttl_secs).await;
        }
        for (key, deps) in snapshot.edges {
            self.graph.register(&key, &deps);
        }
    }

    fn rotate_path(&self) -> PathBuf {
        let dir = PathBuf::from(&self.config.persistence_path);
        dir.join(format!("snapshot-{}.bin", Utc::now().timestamp_millis()))
    }

    async fn prune_old_snapshots(&self) {
        let dir = PathBuf::from(&self.config.persistence_path);
        let Ok(mut read_dir) = tokio::fs::read_dir(&dir).await else {
            return;
        };
        let mut files = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            files.push(entry.path());
        }
        files.sort();
        let keep = self.config.persistence_rotate_count;
        if files.len() > keep {
            for stale in &files[..files.len() - keep] {
                let _ = tokio::fs::remove_file(stale).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrefetchConfig;

    fn cache() -> MultiLevelCache {
        MultiLevelCache::new(
            CacheConfig::default(),
            Arc::new(SledBackend::new_temp()),
            Arc::new(ShardedBackend::new(4)),
            PrefetchConfig::default(),
        )
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_l1() {
        let cache = cache();
        cache.set("a", &"value".to_string(), SetOptions::default()).await.unwrap();
        let (value, level): (Option<String>, HitLevel) = cache.get("a").await;
        assert_eq!(value, Some("value".to_string()));
        assert_eq!(level, HitLevel::L1);
    }

    #[tokio::test]
    async fn invalidating_a_dependency_misses_dependents() {
        let cache = cache();
        cache
            .set("a", &"X".to_string(), SetOptions { ttl_override_secs: None, dependencies: vec!["b".to_string()] })
            .await
            .unwrap();
        cache
            .set("c", &"Y".to_string(), SetOptions { ttl_override_secs: None, dependencies: vec!["a".to_string()] })
            .await
            .unwrap();
        cache.invalidate_dependents("b").await;

        let (a, _): (Option<String>, HitLevel) = cache.get("a").await;
        let (c, _): (Option<String>, HitLevel) = cache.get("c").await;
        let (b, _): (Option<String>, HitLevel) = cache.get("b").await;
        assert!(a.is_none());
        assert!(c.is_none());
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn l3_hit_promotes_into_l2_and_l1() {
        let cache = cache();
        let encoded = encode(&"from-l3".to_string(), 1024, crate::config::CompressionAlgorithm::None).unwrap();
        cache.l3.set("only-l3", encoded, 3600).await.unwrap();

        let (value, level): (Option<String>, HitLevel) = cache.get("only-l3").await;
        assert_eq!(value, Some("from-l3".to_string()));
        assert_eq!(level, HitLevel::L3);

        let (value2, level2): (Option<String>, HitLevel) = cache.get("only-l3").await;
        assert_eq!(value2, Some("from-l3".to_string()));
        assert_eq!(level2, HitLevel::L1);
    }
}
