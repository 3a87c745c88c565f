use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::config::WorkerConfig;
use crate::heap::IndexedHeap;
use crate::workers::task::{Task, TaskKind, TaskOutput, TaskStatus};
use crate::workers::{WorkerError, WorkerResult};

/// Implemented once per [`TaskKind`] and registered into the pool. Mirrors
/// the teacher's `TaskHandler` trait, but handlers now receive a typed
/// [`Task`] whose payload is a closed enum rather than an opaque job.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> WorkerResult<TaskOutput>;
}

/// Priority-ordered queue of tasks, gated by a dependency graph: a task is
/// only eligible to run once every dependency id has completed.
struct TaskQueue {
    ready: Mutex<IndexedHeap<Task>>,
    waiting: DashMap<String, Task>,
    remaining_deps: DashMap<String, HashSet<String>>,
    dependents: DashMap<String, Vec<String>>,
    completed: DashSet<String>,
}

impl TaskQueue {
    fn new() -> Self {
        Self {
            ready: Mutex::new(IndexedHeap::new()),
            waiting: DashMap::new(),
            remaining_deps: DashMap::new(),
            dependents: DashMap::new(),
            completed: DashSet::new(),
        }
    }

    fn push(&self, task: Task) {
        let pending_deps: HashSet<String> = task
            .dependencies
            .iter()
            .filter(|d| !self.completed.contains(*d))
            .cloned()
            .collect();

        if pending_deps.is_empty() {
            let id = task.id.clone();
            let priority = task.priority;
            let created_at = task.created_at;
            self.ready.lock().insert(id, priority, created_at, task);
            return;
        }

        for dep in &pending_deps {
            self.dependents.entry(dep.clone()).or_default().push(task.id.clone());
        }
        self.remaining_deps.insert(task.id.clone(), pending_deps);
        self.waiting.insert(task.id.clone(), task);
    }

    fn pop_ready(&self) -> Option<Task> {
        self.ready.lock().extract_max().map(|e| e.payload)
    }

    /// Marks `task_id` completed and promotes any dependent whose last
    /// outstanding dependency was `task_id`.
    fn complete(&self, task_id: &str) {
        self.completed.insert(task_id.to_string());
        let Some((_, dependents)) = self.dependents.remove(task_id) else {
            return;
        };
        for dependent_id in dependents {
            let now_ready = {
                let mut remaining = match self.remaining_deps.get_mut(&dependent_id) {
                    Some(r) => r,
                    None => continue,
                };
                remaining.remove(task_id);
                remaining.is_empty()
            };
            if now_ready {
                self.remaining_deps.remove(&dependent_id);
                if let Some((_, task)) = self.waiting.remove(&dependent_id) {
                    let id = task.id.clone();
                    let priority = task.priority;
                    let created_at = task.created_at;
                    self.ready.lock().insert(id, priority, created_at, task);
                }
            }
        }
    }

    fn remove(&self, task_id: &str) -> bool {
        if self.ready.lock().remove(task_id).is_some() {
            return true;
        }
        self.waiting.remove(task_id).is_some()
    }

    fn len(&self) -> usize {
        self.ready.lock().len() + self.waiting.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub active_workers: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub queue_depth: usize,
}

struct WorkerCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    consecutive_errors: AtomicU64,
}

/// Fixed-to-elastic pool of task executors draining a dependency-ordered
/// task queue.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    handlers: RwLock<HashMap<TaskKind, Arc<dyn TaskHandler>>>,
    config: WorkerConfig,
    active_workers: Arc<AtomicUsize>,
    shutting_down: Arc<AtomicBool>,
    counters: Arc<WorkerCounters>,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            queue: Arc::new(TaskQueue::new()),
            handlers: RwLock::new(HashMap::new()),
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(WorkerCounters {
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                consecutive_errors: AtomicU64::new(0),
            }),
        })
    }

    pub async fn register_handler(&self, kind: TaskKind, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().await.insert(kind, handler);
    }

    /// Submits a task, registering it against its declared dependencies.
    pub fn submit(&self, task: Task) {
        self.queue.push(task);
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        self.queue.remove(task_id)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active_workers: self.active_workers.load(Ordering::Relaxed),
            tasks_completed: self.counters.completed.load(Ordering::Relaxed),
            tasks_failed: self.counters.failed.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Starts `min_workers` permanent loops plus a supervisor loop that
    /// elastically spawns extra workers (up to `max_workers`) when the
    /// backlog exceeds the active count, terminating the extras after
    /// `worker_idle_timeout`.
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for _ in 0..self.config.min_workers {
            handles.push(self.spawn_worker_loop(true));
        }
        handles.push(self.spawn_supervisor());
        handles
    }

    fn spawn_supervisor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if pool.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                let active = pool.active_workers.load(Ordering::Relaxed);
                if pool.queue.len() > active && active < pool.config.max_workers {
                    pool.spawn_worker_loop(false);
                }
            }
        })
    }

    fn spawn_worker_loop(self: &Arc<Self>, permanent: bool) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        pool.active_workers.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let idle_timeout = Duration::from_secs(pool.config.worker_idle_timeout_secs);
            let mut idle_for = Duration::ZERO;
            const POLL_INTERVAL: Duration = Duration::from_millis(50);

            loop {
                if pool.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                match pool.queue.pop_ready() {
                    Some(task) => {
                        idle_for = Duration::ZERO;
                        pool.run_task(task).await;
                    }
                    None => {
                        if !permanent {
                            idle_for += POLL_INTERVAL;
                            if idle_for >= idle_timeout {
                                break;
                            }
                        }
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
            }
            pool.active_workers.fetch_sub(1, Ordering::Relaxed);
        })
    }

    async fn run_task(self: &Arc<Self>, mut task: Task) {
        task.status = TaskStatus::Running;
        let kind = task.kind();
        let handler = self.handlers.read().await.get(&kind).cloned();
        let Some(handler) = handler else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let task_id = task.id.clone();
        let result = tokio::time::timeout(task.timeout, handler.handle(&task)).await;

        match result {
            Ok(Ok(_output)) => {
                task.status = TaskStatus::Completed;
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.counters.consecutive_errors.store(0, Ordering::Relaxed);
                self.queue.complete(&task_id);
            }
            Ok(Err(_failure)) => {
                self.on_task_failure(task);
            }
            Err(_timeout) => {
                self.on_task_failure(task);
            }
        }
    }

    fn on_task_failure(self: &Arc<Self>, mut task: Task) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        let errors = self.counters.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if errors >= self.config.task_error_threshold as u64 {
            self.counters.consecutive_errors.store(0, Ordering::Relaxed);
        }

        if task.retry_count < task.max_retries {
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            self.queue.push(task);
        } else {
            task.status = TaskStatus::Failed;
            self.queue.complete(&task.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::task::TaskPayload;
    use std::sync::atomic::AtomicU32;

    struct CountingHandler {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _task: &Task) -> WorkerResult<TaskOutput> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(TaskOutput::Prefetched(vec![]))
        }
    }

    #[tokio::test]
    async fn dependency_gated_task_runs_after_dependency_completes() {
        let pool = WorkerPool::new(WorkerConfig {
            min_workers: 1,
            max_workers: 1,
            worker_idle_timeout_secs: 1,
            task_error_threshold: 3,
            default_task_timeout_secs: 5,
        });
        let calls = Arc::new(AtomicU32::new(0));
        pool.register_handler(
            TaskKind::PrefetchAnalysis,
            Arc::new(CountingHandler { calls: calls.clone() }),
        )
        .await;

        let first = Task::new(
            TaskPayload::PrefetchAnalysis { keys: vec!["a".into()] },
            1.0,
            Duration::from_secs(1),
        );
        let first_id = first.id.clone();
        let second = Task::new(
            TaskPayload::PrefetchAnalysis { keys: vec!["b".into()] },
            1.0,
            Duration::from_secs(1),
        )
        .with_dependencies(vec![first_id]);

        pool.submit(second);
        assert_eq!(pool.queue.len(), 1);
        assert!(pool.queue.pop_ready().is_none());

        pool.submit(first);
        let handles = pool.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        pool.begin_shutdown();
        for h in handles {
            let _ = h.await;
        }
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}
