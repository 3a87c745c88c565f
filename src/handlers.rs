//! # Queue-Side Task Handlers
//!
//! [`BatchPreparationHandler`](crate::sequencer::BatchPreparationHandler)
//! lives next to the sequencer since batch preparation is entirely its
//! concern. The two smaller handlers here close the other two loops the
//! queue and cache open onto the worker pool: a transaction's priority is
//! recomputed off the queue's own control path
//! ([`PriorityRequest`]/[`PriorityResult`]), and the cache's predictive
//! prefetcher is driven by a loader that reads through the store. Both
//! follow the same full-side-effect shape as `BatchPreparationHandler`,
//! since [`WorkerPool::run_task`](crate::workers::pool) discards a
//! handler's returned `TaskOutput` beyond marking the task complete.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::MultiLevelCache;
use crate::queue::{PriorityQueue, PriorityResult};
use crate::store::StoreClient;
use crate::workers::{Task, TaskHandler, TaskOutput, TaskPayload, WorkerError, WorkerResult};

/// Recomputes a transaction's priority score and applies it back to the
/// queue directly, the same way `BatchPreparationHandler` writes its own
/// outcomes rather than returning data for the pool to act on.
pub struct PriorityComputationHandler {
    queue: Arc<PriorityQueue>,
}

impl PriorityComputationHandler {
    pub fn new(queue: Arc<PriorityQueue>) -> Arc<Self> {
        Arc::new(Self { queue })
    }
}

#[async_trait]
impl TaskHandler for PriorityComputationHandler {
    async fn handle(&self, task: &Task) -> WorkerResult<TaskOutput> {
        let TaskPayload::PriorityComputation { transaction } = &task.payload else {
            return Err(WorkerError::TaskFailed("priority computation handler received a mismatched payload".into()));
        };

        let priority = self.queue.score(transaction);
        let result = PriorityResult { id: transaction.id.clone(), priority };
        self.queue.apply_priority_result(result.clone());
        Ok(TaskOutput::Priority(result))
    }
}

/// Drives the cache's predictive prefetcher: the prefetcher itself picks
/// its candidates from recorded access patterns, this handler only supplies
/// the read-through loader (`store.get_transaction`) and lets
/// `MultiLevelCache::prefetch` write hits into L1.
pub struct PrefetchAnalysisHandler {
    cache: Arc<MultiLevelCache>,
    store: Arc<dyn StoreClient>,
}

impl PrefetchAnalysisHandler {
    pub fn new(cache: Arc<MultiLevelCache>, store: Arc<dyn StoreClient>) -> Arc<Self> {
        Arc::new(Self { cache, store })
    }
}

#[async_trait]
impl TaskHandler for PrefetchAnalysisHandler {
    async fn handle(&self, task: &Task) -> WorkerResult<TaskOutput> {
        let TaskPayload::PrefetchAnalysis { keys } = &task.payload else {
            return Err(WorkerError::TaskFailed("prefetch analysis handler received a mismatched payload".into()));
        };
        log::debug!(target: "cache", "prefetch analysis requested for {} hinted keys", keys.len());

        let store = Arc::clone(&self.store);
        let fetched = self
            .cache
            .prefetch(move |key: String| {
                let store = Arc::clone(&store);
                async move {
                    let id = key.strip_prefix("tx:").unwrap_or(&key);
                    store.get_transaction(id).await.ok().flatten()
                }
            })
            .await;

        Ok(TaskOutput::Prefetched(fetched))
    }
}
