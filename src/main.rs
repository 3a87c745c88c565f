//! L2 sequencer binary entry point: loads configuration, wires the
//! priority queue, worker pool, multi-level cache, sequencer, recovery
//! engine, and circuit-breaker-wrapped client together, then serves the
//! inbound HTTP API until shutdown.

use std::sync::Arc;
use std::time::Duration;

use l2_engine::auth::JwtManager;
use l2_engine::cache::{CacheBackend, MultiLevelCache, RedisBackend, ShardedBackend, SledBackend};
use l2_engine::client::{ExternalClient, RpcBlockchainClient};
use l2_engine::config::Config;
use l2_engine::handlers::{PrefetchAnalysisHandler, PriorityComputationHandler};
use l2_engine::metrics::MetricRegistry;
use l2_engine::queue::PriorityQueue;
use l2_engine::recovery::RecoveryEngine;
use l2_engine::sequencer::{BatchPreparationHandler, Sequencer};
use l2_engine::store::{SqlxStore, StoreClient};
use l2_engine::workers::{Task, TaskHandler, TaskKind, TaskPayload, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("L2_CONFIG").unwrap_or_else(|_| "l2-engine.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("no config at {config_path} ({e}), using defaults");
            Config::default()
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.logging.level.clone())).init();

    log::info!(target: "main", "starting l2-engine {}", l2_engine::VERSION);

    let metrics = MetricRegistry::new();

    let store: Arc<dyn StoreClient> = Arc::new(SqlxStore::connect(&config.database).await?);

    let (priority_request_tx, mut priority_request_rx) = tokio::sync::mpsc::unbounded_channel();
    let (queue, event_rx) = PriorityQueue::new(config.queue.clone(), Some(priority_request_tx));

    let worker_pool = WorkerPool::new(config.worker.clone());

    let l2_backend: Arc<dyn CacheBackend> = match &config.cache.l2_url {
        Some(url) => Arc::new(RedisBackend::connect(url).await?),
        None => Arc::new(SledBackend::open(&config.cache.persistence_path)?),
    };
    let l3_backend: Arc<dyn CacheBackend> = Arc::new(ShardedBackend::new(config.cache.l3_nodes.len().max(4)));
    let cache = Arc::new(MultiLevelCache::new(config.cache.clone(), l2_backend, l3_backend, config.prefetch.clone()));
    cache.load_persisted().await;

    let rpc_client = Arc::new(RpcBlockchainClient::new(
        std::env::var("L2_RPC_ENDPOINT").unwrap_or_else(|_| "http://localhost:8545".to_string()),
        Duration::from_secs(10),
    ));
    let client = Arc::new(ExternalClient::new(rpc_client, config.circuit_breaker.clone()));

    let sequencer = Sequencer::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&worker_pool),
        Arc::clone(&cache),
        metrics.clone(),
        config.sequencer.clone(),
        config.queue.batch_size,
        Duration::from_secs(config.worker.default_task_timeout_secs),
    );

    let batch_handler = BatchPreparationHandler::new(
        Arc::clone(&store),
        Arc::clone(&client),
        Arc::clone(&queue),
        Arc::clone(&cache),
        metrics.clone(),
        config.sequencer.max_concurrent_batches,
        config.cache.compression_threshold,
        config.cache.compression_algorithm,
    );
    worker_pool
        .register_handler(TaskKind::BatchPreparation, batch_handler as Arc<dyn TaskHandler>)
        .await;

    let priority_handler = PriorityComputationHandler::new(Arc::clone(&queue));
    worker_pool
        .register_handler(TaskKind::PriorityComputation, priority_handler as Arc<dyn TaskHandler>)
        .await;

    let prefetch_handler = PrefetchAnalysisHandler::new(Arc::clone(&cache), Arc::clone(&store));
    worker_pool
        .register_handler(TaskKind::PrefetchAnalysis, prefetch_handler as Arc<dyn TaskHandler>)
        .await;

    let recovery = RecoveryEngine::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&client),
        metrics.clone(),
        config.recovery.clone(),
    );

    let auth = Arc::new(JwtManager::new(
        config.auth.jwt_secret.clone(),
        config.auth.token_ttl_secs,
        config.auth.max_secret_history,
    ));

    // Bridges the queue's priority-request channel to the worker pool, per
    // spec.md §9's one-way message-passing guidance: the queue never calls
    // into a worker directly, it only publishes requests and accepts
    // results pushed back through `apply_priority_result`.
    let priority_bridge = Arc::clone(&worker_pool);
    let priority_task_timeout = Duration::from_secs(config.worker.default_task_timeout_secs);
    tokio::spawn(async move {
        while let Some(request) = priority_request_rx.recv().await {
            let task = Task::new(
                TaskPayload::PriorityComputation { transaction: request.transaction },
                0.5,
                priority_task_timeout,
            );
            priority_bridge.submit(task);
        }
    });

    let mut handles = worker_pool.start();
    handles.extend(queue.spawn_background_tasks());
    handles.extend(sequencer.spawn_background_tasks(event_rx));

    // Recovery's detectors re-read these providers every tick; a real
    // deployment would back them with "every address/batch touched in the
    // last N confirmed batches" rather than an empty snapshot.
    handles.push(recovery.spawn_background_tasks(Vec::new, Vec::new));

    let cache_for_persistence = Arc::clone(&cache);
    let persistence_interval = Duration::from_secs(config.cache.persistence_interval_secs.max(1));
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(persistence_interval);
        loop {
            ticker.tick().await;
            cache_for_persistence.persist().await;
        }
    }));

    let app_state = Arc::new(l2_engine::api::AppState {
        sequencer: Arc::clone(&sequencer),
        auth,
        metrics: metrics.clone(),
    });
    let app = l2_engine::api::router(app_state);

    let bind_addr = std::env::var("L2_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    log::info!(target: "main", "listening on {bind_addr}");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        log::info!(target: "main", "shutdown signal received");
    };

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    log::info!(target: "main", "shutting down");
    queue.begin_shutdown();
    worker_pool.begin_shutdown();
    cache.persist().await;
    for handle in handles {
        handle.abort();
    }

    Ok(())
}
