//! Crate configuration, loaded from a TOML file with environment-variable
//! overrides for secrets (mirrors `database::connection_pool::DatabaseConfig`'s
//! default-then-override pattern).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Priority queue tuning.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker pool tuning.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Sequencer tuning.
    #[serde(default)]
    pub sequencer: SequencerConfig,

    /// Multi-level cache tuning.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Predictive prefetcher tuning.
    #[serde(default)]
    pub prefetch: PrefetchConfig,

    /// Recovery engine tuning.
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Circuit breaker tuning.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Persistence backend connection settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging verbosity.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Auth collaborator settings.
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            sequencer: SequencerConfig::default(),
            cache: CacheConfig::default(),
            prefetch: PrefetchConfig::default(),
            recovery: RecoveryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, applying environment-variable
    /// overrides for fields that carry secrets (database URL, RPC endpoint).
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("L2_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(url) = std::env::var("L2_CACHE_L2_URL") {
            self.cache.l2_url = Some(url);
        }
        if let Ok(nodes) = std::env::var("L2_CACHE_L3_NODES") {
            self.cache.l3_nodes = nodes.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(secret) = std::env::var("L2_AUTH_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
    }
}

/// `priority_weights {fee, age, size, sender}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub fee: f64,
    pub age: f64,
    pub size: f64,
    pub sender: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            fee: 0.5,
            age: 0.3,
            size: 0.1,
            sender: 0.1,
        }
    }
}

/// Priority queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub priority_levels: u8,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub adaptive_interval_ms: u64,
    pub aging_interval_ms: u64,
    pub aging_factor: f64,
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub priority_weights: PriorityWeights,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub fee_max: f64,
    pub age_max_secs: f64,
    pub size_max_bytes: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100_000,
            priority_levels: 10,
            batch_size: 100,
            batch_interval_ms: 1_000,
            adaptive_interval_ms: 5_000,
            aging_interval_ms: 30_000,
            aging_factor: 1.1,
            high_watermark: 0.9,
            low_watermark: 0.7,
            priority_weights: PriorityWeights::default(),
            max_retries: 3,
            retry_delay_ms: 500,
            fee_max: 1_000_000.0,
            age_max_secs: 300.0,
            size_max_bytes: 65_536.0,
        }
    }
}

impl QueueConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }
    pub fn aging_interval(&self) -> Duration {
        Duration::from_millis(self.aging_interval_ms)
    }
    pub fn adaptive_interval(&self) -> Duration {
        Duration::from_millis(self.adaptive_interval_ms)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub worker_idle_timeout_secs: u64,
    pub task_error_threshold: u32,
    pub default_task_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 16,
            worker_idle_timeout_secs: 60,
            task_error_threshold: 3,
            default_task_timeout_secs: 30,
        }
    }
}

/// Sequencer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub max_concurrent_batches: usize,
    pub dedup_capacity: usize,
    pub min_poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_batches: 8,
            dedup_capacity: 50_000,
            min_poll_interval_ms: 1_000,
            max_poll_interval_ms: 300_000,
        }
    }
}

/// `cache {l1_max, l1_ttl, l2_url, l2_ttl, l3_nodes, l3_ttl, compression_threshold, compression_algorithm}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_max: u64,
    pub l1_ttl_secs: u64,
    pub l2_url: Option<String>,
    pub l2_ttl_secs: u64,
    pub l3_nodes: Vec<String>,
    pub l3_ttl_secs: u64,
    pub compression_threshold: usize,
    pub compression_algorithm: CompressionAlgorithm,
    pub max_transitive_depth: u32,
    pub persistence_path: String,
    pub persistence_interval_secs: u64,
    pub persistence_rotate_count: usize,
}

/// Compression algorithm selection for values above `compression_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Deflate,
    Brotli,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max: 10_000,
            l1_ttl_secs: 300,
            l2_url: None,
            l2_ttl_secs: 3_600,
            l3_nodes: Vec::new(),
            l3_ttl_secs: 86_400,
            compression_threshold: 1_024,
            compression_algorithm: CompressionAlgorithm::Deflate,
            max_transitive_depth: 16,
            persistence_path: "./cache-snapshots".to_string(),
            persistence_interval_secs: 60,
            persistence_rotate_count: 3,
        }
    }
}

/// `prefetch {strategy, threshold, pattern_length, max_items}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub enabled: bool,
    pub threshold: f64,
    pub pattern_length: usize,
    pub max_items: usize,
    pub sequence_weight: f64,
    pub frequency_weight: f64,
    pub temporal_weight: f64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.3,
            pattern_length: 3,
            max_items: 5,
            sequence_weight: 0.5,
            frequency_weight: 0.3,
            temporal_weight: 0.2,
        }
    }
}

/// `recovery {check_interval_ms, max_attempts}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub check_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            max_attempts: 3,
        }
    }
}

/// `circuit_breaker {threshold, reset_timeout}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub window_secs: u64,
    pub reset_timeout_secs: u64,
    pub half_open_trial_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            reset_timeout_secs: 30,
            half_open_trial_calls: 1,
        }
    }
}

/// Persistence backend connection settings, mirrors
/// `database::connection_pool::DatabaseConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://l2_engine.db".to_string(),
            min_connections: 5,
            max_connections: 100,
            connect_timeout_secs: 30,
            idle_timeout_secs: 600,
        }
    }
}

/// Logging verbosity, read by `main` at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Auth collaborator settings: JWT signing secret and rotation grace period.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
    pub max_secret_history: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me-in-production".to_string(),
            token_ttl_secs: 3_600,
            max_secret_history: 3,
        }
    }
}
