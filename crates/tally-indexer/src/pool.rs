//! Worker pool for per-transaction tasks.
//!
//! `n` tokio tasks each own an mpsc receiver of [`TaskRequest`]s. The pool
//! hands requests out round-robin, tags each with a correlation id, and a
//! router task matches [`TaskResponse`]s back to the waiting caller. Handlers
//! are looked up by task name in a [`TaskRegistry`].
//!
//! A worker whose handler panics is restarted after a delay; requests it held
//! fail with [`PoolError::WorkerCrashed`]. A worker whose channel closes exits
//! normally and is not restarted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{Id, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::PoolError;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskRequest {
    pub id: u64,
    pub task: String,
    pub argument: serde_json::Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TaskResponse {
    pub id: u64,
    pub error: Option<String>,
}

/// A named unit of work run on a pool worker.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, argument: serde_json::Value) -> Result<(), String>;
}

impl<F> TaskHandler for F
where
    F: Fn(serde_json::Value) -> Result<(), String> + Send + Sync,
{
    fn handle(&self, argument: serde_json::Value) -> Result<(), String> {
        self(argument)
    }
}

/// Task handlers by name.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

struct Pending {
    worker: usize,
    reply: oneshot::Sender<Result<(), PoolError>>,
}

struct PoolInner {
    registry: Arc<TaskRegistry>,
    senders: RwLock<Vec<mpsc::UnboundedSender<TaskRequest>>>,
    pending: DashMap<u64, Pending>,
    handled: Vec<AtomicU64>,
    next_worker: AtomicUsize,
    next_id: AtomicU64,
    restarts: AtomicU64,
    closed: AtomicBool,
}

impl PoolInner {
    /// Fail every request routed to `worker`.
    fn fail_worker(&self, worker: usize) -> usize {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.worker == worker)
            .map(|entry| *entry.key())
            .collect();
        for id in &ids {
            if let Some((_, pending)) = self.pending.remove(id) {
                let _ = pending
                    .reply
                    .send(Err(PoolError::WorkerCrashed { worker, id: *id }));
            }
        }
        ids.len()
    }
}

/// Round-robin pool of task workers.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count())
            .field("pending", &self.inner.pending.len())
            .field("restarts", &self.restarts())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `workers` worker tasks serving `registry`.
    pub fn start(workers: usize, registry: TaskRegistry, restart_delay: Duration) -> Self {
        let registry = Arc::new(registry);
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let mut senders = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let inner = Arc::new(PoolInner {
            registry,
            senders: RwLock::new(senders),
            pending: DashMap::new(),
            handled: (0..workers).map(|_| AtomicU64::new(0)).collect(),
            next_worker: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            restarts: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(route_responses(Arc::clone(&inner), response_rx));
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&inner),
            receivers,
            response_tx,
            restart_delay,
        ));
        info!(workers, "worker pool started");

        Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.senders.read().len()
    }

    /// Number of worker restarts after crashes.
    pub fn restarts(&self) -> u64 {
        self.inner.restarts.load(Ordering::Relaxed)
    }

    /// Requests completed by each worker, by worker index.
    pub fn handled_counts(&self) -> Vec<u64> {
        self.inner
            .handled
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// Run `task` with `argument` on the next worker and wait for its answer.
    pub async fn send_task(
        &self,
        task: &str,
        argument: serde_json::Value,
    ) -> Result<(), PoolError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        if !self.inner.registry.contains(task) {
            return Err(PoolError::UnknownTask(task.to_string()));
        }

        let (reply, response) = oneshot::channel();
        let (worker, id) = {
            let senders = self.inner.senders.read();
            if senders.is_empty() {
                return Err(PoolError::NoWorkers);
            }
            let worker = self.inner.next_worker.fetch_add(1, Ordering::Relaxed) % senders.len();
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            self.inner.pending.insert(id, Pending { worker, reply });

            let request = TaskRequest {
                id,
                task: task.to_string(),
                argument,
            };
            if senders[worker].send(request).is_err() {
                self.inner.pending.remove(&id);
                return Err(PoolError::WorkerCrashed { worker, id });
            }
            (worker, id)
        };
        debug!(task, worker, id, "dispatched task");

        response.await.map_err(|_| PoolError::Closed)?
    }

    /// Close every worker channel and wait for the workers to drain.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.senders.write().clear();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.senders.write().clear();
    }
}

async fn run_worker(
    index: usize,
    mut requests: mpsc::UnboundedReceiver<TaskRequest>,
    inner: Arc<PoolInner>,
    responses: mpsc::UnboundedSender<TaskResponse>,
    delay: Option<Duration>,
) -> usize {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    while let Some(request) = requests.recv().await {
        let result = match inner.registry.get(&request.task) {
            Some(handler) => {
                // Handlers do blocking store I/O.
                let handler = Arc::clone(handler);
                let argument = request.argument;
                match tokio::task::spawn_blocking(move || handler.handle(argument)).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(e) => Err(format!("handler task failed: {e}")),
                }
            }
            None => Err(format!("unknown task: {}", request.task)),
        };
        if let Some(counter) = inner.handled.get(index) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        let _ = responses.send(TaskResponse {
            id: request.id,
            error: result.err(),
        });
    }
    index
}

async fn supervise(
    inner: Arc<PoolInner>,
    receivers: Vec<mpsc::UnboundedReceiver<TaskRequest>>,
    responses: mpsc::UnboundedSender<TaskResponse>,
    restart_delay: Duration,
) {
    let mut workers = JoinSet::new();
    let mut indices: HashMap<Id, usize> = HashMap::new();

    for (index, rx) in receivers.into_iter().enumerate() {
        let handle = workers.spawn(run_worker(
            index,
            rx,
            Arc::clone(&inner),
            responses.clone(),
            None,
        ));
        indices.insert(handle.id(), index);
    }

    while let Some(joined) = workers.join_next_with_id().await {
        match joined {
            Ok((id, index)) => {
                indices.remove(&id);
                debug!(worker = index, "worker exited");
            }
            Err(e) => {
                let Some(index) = indices.remove(&e.id()) else {
                    continue;
                };
                let restart = e.is_panic() && !inner.closed.load(Ordering::SeqCst);

                // The new channel must be in place before callers are woken.
                let rx = if restart {
                    let (tx, rx) = mpsc::unbounded_channel();
                    match inner.senders.write().get_mut(index) {
                        Some(slot) => *slot = tx,
                        None => continue,
                    }
                    Some(rx)
                } else {
                    None
                };
                let failed = inner.fail_worker(index);
                let Some(rx) = rx else {
                    continue;
                };

                let restarts = inner.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    worker = index,
                    failed,
                    restarts,
                    delay_ms = restart_delay.as_millis() as u64,
                    "worker crashed, restarting"
                );
                let handle = workers.spawn(run_worker(
                    index,
                    rx,
                    Arc::clone(&inner),
                    responses.clone(),
                    Some(restart_delay),
                ));
                indices.insert(handle.id(), index);
            }
        }
    }
}

async fn route_responses(
    inner: Arc<PoolInner>,
    mut responses: mpsc::UnboundedReceiver<TaskResponse>,
) {
    while let Some(response) = responses.recv().await {
        let Some((_, pending)) = inner.pending.remove(&response.id) else {
            continue;
        };
        let result = match response.error {
            None => Ok(()),
            Some(message) => Err(PoolError::Task(message)),
        };
        let _ = pending.reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> TaskRegistry {
        let ok: Arc<dyn TaskHandler> =
            Arc::new(|_arg: serde_json::Value| -> Result<(), String> { Ok(()) });
        let fail: Arc<dyn TaskHandler> =
            Arc::new(|arg: serde_json::Value| -> Result<(), String> {
                Err(format!("bad argument {arg}"))
            });
        let crash: Arc<dyn TaskHandler> = Arc::new(|arg: serde_json::Value| -> Result<(), String> {
            if arg == json!("boom") {
                panic!("handler crashed");
            }
            Ok(())
        });
        TaskRegistry::new()
            .register("ok", ok)
            .register("fail", fail)
            .register("crash", crash)
    }

    #[tokio::test]
    async fn round_robin_dispatch() {
        let pool = WorkerPool::start(3, registry(), Duration::from_millis(10));
        for _ in 0..6 {
            pool.send_task("ok", json!(null)).await.unwrap();
        }
        assert_eq!(pool.handled_counts(), vec![2, 2, 2]);
    }

    #[tokio::test]
    async fn handlers_run_off_the_async_workers() {
        let blocking: Arc<dyn TaskHandler> =
            Arc::new(|_arg: serde_json::Value| -> Result<(), String> {
                // block_on panics when called from an async worker thread.
                tokio::runtime::Handle::current().block_on(async {});
                Ok(())
            });
        let pool = WorkerPool::start(
            1,
            TaskRegistry::new().register("blocking", blocking),
            Duration::from_millis(10),
        );
        pool.send_task("blocking", json!(null)).await.unwrap();
        assert_eq!(pool.restarts(), 0);
    }

    #[tokio::test]
    async fn unknown_task_is_rejected() {
        let pool = WorkerPool::start(1, registry(), Duration::from_millis(10));
        let err = pool.send_task("nope", json!(null)).await.unwrap_err();
        assert_eq!(err, PoolError::UnknownTask("nope".into()));
    }

    #[tokio::test]
    async fn handler_error_is_returned() {
        let pool = WorkerPool::start(2, registry(), Duration::from_millis(10));
        let err = pool.send_task("fail", json!(7)).await.unwrap_err();
        assert_eq!(err, PoolError::Task("bad argument 7".into()));
    }

    #[tokio::test]
    async fn no_workers() {
        let pool = WorkerPool::start(0, registry(), Duration::from_millis(10));
        assert_eq!(
            pool.send_task("ok", json!(null)).await.unwrap_err(),
            PoolError::NoWorkers
        );
    }

    #[tokio::test]
    async fn crashed_worker_is_restarted() {
        let pool = WorkerPool::start(1, registry(), Duration::from_millis(10));
        let err = pool.send_task("crash", json!("boom")).await.unwrap_err();
        assert!(matches!(err, PoolError::WorkerCrashed { worker: 0, .. }));

        // Queued behind the restart delay, then served by the new worker.
        pool.send_task("crash", json!("fine")).await.unwrap();
        assert_eq!(pool.restarts(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_pool() {
        let pool = WorkerPool::start(2, registry(), Duration::from_millis(10));
        pool.send_task("ok", json!(null)).await.unwrap();
        pool.shutdown().await;
        assert_eq!(
            pool.send_task("ok", json!(null)).await.unwrap_err(),
            PoolError::Closed
        );
        assert_eq!(pool.restarts(), 0);
    }

    #[test]
    fn envelope_json_shape() {
        let req = TaskRequest {
            id: 4,
            task: "tag-transaction-wallets".into(),
            argument: json!({"txid": "00"}),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["id"], 4);
        assert_eq!(value["task"], "tag-transaction-wallets");
        let resp: TaskResponse = serde_json::from_str(r#"{"id":4,"error":null}"#).unwrap();
        assert_eq!(resp, TaskResponse { id: 4, error: None });
    }
}
