//! Cache tier backends. Every tier implements the same narrow
//! [`CacheBackend`] interface (spec.md §9); `keys_with_prefix` is the one
//! optional method — a backend that cannot enumerate its keys returns
//! `None` rather than an error, and callers degrade gracefully (skip
//! prefix invalidation for that tier) per spec.md §4.3.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cache::{CacheError, CacheResult, EncodedData};

/// One cache tier's narrow contract: `get/set/delete/keys(prefix)?/close`.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Option<EncodedData>;
    async fn set(&self, key: &str, value: EncodedData, ttl_secs: u64) -> CacheResult<()>;
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// `None` means "this backend cannot enumerate keys"; callers must
    /// treat that as "skip", not as "zero matches".
    async fn keys_with_prefix(&self, _prefix: &str) -> Option<Vec<String>> {
        None
    }

    async fn close(&self) {}

    /// Only L1 needs this, for cache persistence; other tiers can ignore
    /// it (default: unsupported).
    async fn snapshot_entries(&self) -> Option<Vec<(String, EncodedData, Option<i64>)>> {
        None
    }
}

struct MokaEntry {
    value: EncodedData,
    expires_at: Option<i64>,
}

/// L1: in-process bounded LRU with per-entry TTL, backed by `moka`.
pub struct MokaBackend {
    cache: moka::future::Cache<String, Arc<MokaEntry>>,
}

impl MokaBackend {
    pub fn new(max_capacity: u64, default_ttl_secs: u64) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(max_capacity.max(1))
            .time_to_live(Duration::from_secs(default_ttl_secs.max(1)))
            .build();
        Self { cache }
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    async fn get(&self, key: &str) -> Option<EncodedData> {
        let entry = self.cache.get(key).await?;
        if let Some(expires_at) = entry.expires_at {
            if expires_at <= chrono::Utc::now().timestamp() {
                self.cache.invalidate(key).await;
                return None;
            }
        }
        Some(entry.value.clone())
    }

    async fn set(&self, key: &str, value: EncodedData, ttl_secs: u64) -> CacheResult<()> {
        let expires_at = chrono::Utc::now().timestamp() + ttl_secs as i64;
        self.cache
            .insert(
                key.to_string(),
                Arc::new(MokaEntry {
                    value,
                    expires_at: Some(expires_at),
                }),
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Option<Vec<String>> {
        Some(
            self.cache
                .iter()
                .map(|(k, _)| k.as_ref().clone())
                .filter(|k| k.starts_with(prefix))
                .collect(),
        )
    }

    async fn snapshot_entries(&self) -> Option<Vec<(String, EncodedData, Option<i64>)>> {
        Some(
            self.cache
                .iter()
                .map(|(k, v)| (k.as_ref().clone(), v.value.clone(), v.expires_at))
                .collect(),
        )
    }
}

/// L2: shared KV, a single embedded instance. Backed by `sled` (embedded,
/// ACID, sorted keys — the teacher's corpus uses it wherever an
/// "enterprise" module wants a durable local KV without a network round
/// trip) so this tier works standalone with no external service. See
/// [`RedisBackend`] for the shared-instance alternative `main` selects when
/// `config.cache.l2_url` is set.
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    pub fn open(path: &str) -> CacheResult<Self> {
        let db = sled::open(path).map_err(|e| CacheError::TierUnavailable(e.to_string()))?;
        Ok(Self { db })
    }

    pub fn new_temp() -> Self {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary sled db");
        Self { db }
    }

    fn ttl_key(key: &str) -> String {
        format!("__ttl__:{key}")
    }
}

#[async_trait]
impl CacheBackend for SledBackend {
    async fn get(&self, key: &str) -> Option<EncodedData> {
        if let Ok(Some(raw)) = self.db.get(Self::ttl_key(key)) {
            if let Ok(expires_at) = bincode::deserialize::<i64>(&raw) {
                if expires_at <= chrono::Utc::now().timestamp() {
                    let _ = self.db.remove(key);
                    let _ = self.db.remove(Self::ttl_key(key));
                    return None;
                }
            }
        }
        let raw = self.db.get(key).ok().flatten()?;
        bincode::deserialize(&raw).ok()
    }

    async fn set(&self, key: &str, value: EncodedData, ttl_secs: u64) -> CacheResult<()> {
        let bytes = bincode::serialize(&value).map_err(|e| CacheError::Codec(e.to_string()))?;
        self.db.insert(key, bytes).map_err(|e| CacheError::TierUnavailable(e.to_string()))?;
        let expires_at = chrono::Utc::now().timestamp() + ttl_secs as i64;
        let ttl_bytes = bincode::serialize(&expires_at).map_err(|e| CacheError::Codec(e.to_string()))?;
        self.db
            .insert(Self::ttl_key(key), ttl_bytes)
            .map_err(|e| CacheError::TierUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.db.remove(key).map_err(|e| CacheError::TierUnavailable(e.to_string()))?;
        self.db
            .remove(Self::ttl_key(key))
            .map_err(|e| CacheError::TierUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Option<Vec<String>> {
        Some(
            self.db
                .scan_prefix(prefix.as_bytes())
                .filter_map(|item| item.ok())
                .filter_map(|(k, _)| String::from_utf8(k.to_vec()).ok())
                .filter(|k| !k.starts_with("__ttl__:"))
                .collect(),
        )
    }

    async fn close(&self) {
        let _ = self.db.flush_async().await;
    }
}

/// L2 alternative: a shared KV fronted by a real `redis` instance, for
/// deployments where L2 must be visible to every sequencer replica rather
/// than local to one process. Implements the same narrow contract as
/// [`SledBackend`] so `MultiLevelCache` never needs to know which one is
/// wired in; `main` picks between them from `config.cache.l2_url`.
pub struct RedisBackend {
    manager: redis::aio::ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(url).map_err(|e| CacheError::TierUnavailable(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CacheError::TierUnavailable(e.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Option<EncodedData> {
        use redis::AsyncCommands;
        let raw: Option<Vec<u8>> = self.manager.clone().get(key).await.ok()?;
        bincode::deserialize(&raw?).ok()
    }

    async fn set(&self, key: &str, value: EncodedData, ttl_secs: u64) -> CacheResult<()> {
        use redis::AsyncCommands;
        let bytes = bincode::serialize(&value).map_err(|e| CacheError::Codec(e.to_string()))?;
        self.manager
            .clone()
            .set_ex::<_, _, ()>(key, bytes, ttl_secs.max(1))
            .await
            .map_err(|e| CacheError::TierUnavailable(e.to_string()))
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        use redis::AsyncCommands;
        self.manager
            .clone()
            .del::<_, ()>(key)
            .await
            .map_err(|e| CacheError::TierUnavailable(e.to_string()))
    }

    // `KEYS`/`SCAN` against a shared redis instance is expensive and
    // typically disabled in production; prefix invalidation degrades the
    // same way it does for `ShardedBackend`.
}

/// L3: sharded/distributed KV. Keys are hashed into `shard_count`
/// independent maps, standing in locally for a cluster of distributed
/// nodes (spec.md §4.3 "or equivalent"). Intentionally does *not* support
/// `keys_with_prefix` — a real distributed KV (consistent-hash ring,
/// scatter-gather) may not offer cheap prefix scans either, and this tier
/// exists precisely to exercise the "degrade when unsupported" path.
pub struct ShardedBackend {
    shards: Vec<DashMap<String, (EncodedData, i64)>>,
}

impl ShardedBackend {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count.max(1)).map(|_| DashMap::new()).collect(),
        }
    }

    fn shard_for(&self, key: &str) -> &DashMap<String, (EncodedData, i64)> {
        let hash = blake3::hash(key.as_bytes());
        let idx = (hash.as_bytes()[0] as usize) % self.shards.len();
        &self.shards[idx]
    }
}

#[async_trait]
impl CacheBackend for ShardedBackend {
    async fn get(&self, key: &str) -> Option<EncodedData> {
        let shard = self.shard_for(key);
        let (value, expires_at) = shard.get(key).map(|e| e.clone())?;
        if expires_at <= chrono::Utc::now().timestamp() {
            shard.remove(key);
            return None;
        }
        Some(value)
    }

    async fn set(&self, key: &str, value: EncodedData, ttl_secs: u64) -> CacheResult<()> {
        let expires_at = chrono::Utc::now().timestamp() + ttl_secs as i64;
        self.shard_for(key).insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.shard_for(key).remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{encode, StoredAlgorithm};
    use crate::config::CompressionAlgorithm;

    fn sample() -> EncodedData {
        encode(&"value".to_string(), 1024, CompressionAlgorithm::None).unwrap()
    }

    #[tokio::test]
    async fn moka_tier_round_trips_and_expires() {
        let backend = MokaBackend::new(10, 3600);
        backend.set("k", sample(), 3600).await.unwrap();
        assert!(backend.get("k").await.is_some());
        backend.set("expired", sample(), 0).await.unwrap();
        // expires_at == now, already past by the time get() runs
        assert!(backend.get("expired").await.is_none());
    }

    #[tokio::test]
    async fn sled_tier_supports_prefix_enumeration() {
        let backend = SledBackend::new_temp();
        backend.set("user:1", sample(), 3600).await.unwrap();
        backend.set("user:2", sample(), 3600).await.unwrap();
        backend.set("order:1", sample(), 3600).await.unwrap();
        let keys = backend.keys_with_prefix("user:").await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn sharded_tier_degrades_prefix_enumeration() {
        let backend = ShardedBackend::new(4);
        backend.set("k", sample(), 3600).await.unwrap();
        assert!(backend.keys_with_prefix("k").await.is_none());
        assert!(backend.get("k").await.is_some());
    }

    #[test]
    fn encoded_data_has_expected_algorithm_tag() {
        assert_eq!(sample().algorithm, StoredAlgorithm::None);
    }
}
