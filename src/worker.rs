//! Background worker pool.
//!
//! A small fixed set of workers drains one bounded FIFO queue; that queue is
//! the sole channel between capture and background processing, and the
//! system's backpressure boundary. `enqueue` waits briefly on a full queue
//! and then reports `QueueFull`, which surfaces to the HTTP layer as a
//! retryable error.
//!
//! Task failures are logged and never crash the pool; the affected chunk
//! stays at `inbox` for the startup scan to pick up. There are no automatic
//! retries: a retry loop against a struggling local LLM only compounds the
//! problem.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};

/// A unit of background work. Tasks are independent by chunk id; FIFO order
/// holds per queue, not across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    ProcessChunk(Uuid),
    ExtractEntities(Uuid),
    CompactProject(Uuid),
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::ProcessChunk(id) => write!(f, "process_chunk({id})"),
            Task::ExtractEntities(id) => write!(f, "extract_entities({id})"),
            Task::CompactProject(id) => write!(f, "compact_project({id})"),
        }
    }
}

/// Executes tasks on behalf of the pool. Implementations check the
/// cancellation token at their suspension points.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task, cancel: &CancellationToken) -> Result<()>;
}

/// Cloneable producer half of the queue.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
    enqueue_wait: Duration,
}

impl TaskQueue {
    /// Enqueue a task, waiting at most `enqueue_wait` for space.
    pub async fn enqueue(&self, task: Task) -> Result<()> {
        match self.tx.send_timeout(task, self.enqueue_wait).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(Error::QueueFull),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(Error::Unavailable("worker pool")),
        }
    }

    /// Reserve queue capacity without committing a task yet. Capture uses
    /// this so backpressure rejects before anything is persisted.
    pub async fn reserve(&self) -> Result<TaskPermit> {
        match tokio::time::timeout(self.enqueue_wait, self.tx.clone().reserve_owned()).await {
            Ok(Ok(permit)) => Ok(TaskPermit { permit }),
            Ok(Err(_)) => Err(Error::Unavailable("worker pool")),
            Err(_) => Err(Error::QueueFull),
        }
    }
}

/// A reserved queue slot. Dropping it without sending releases the slot.
pub struct TaskPermit {
    permit: mpsc::OwnedPermit<Task>,
}

impl TaskPermit {
    pub fn send(self, task: Task) {
        self.permit.send(task);
    }
}

/// The pool itself: owns the workers and the consumer half of the queue.
///
/// Construction is two-phase so the handler can be built around the queue:
/// [`WorkerPool::new`] creates the channel, [`WorkerPool::start_workers`]
/// spawns the workers once a handler exists.
pub struct WorkerPool {
    queue: TaskQueue,
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    worker_count: usize,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    shutdown_grace: Duration,
}

impl WorkerPool {
    pub fn new(config: &WorkerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Self {
            queue: TaskQueue {
                tx,
                enqueue_wait: Duration::from_millis(config.enqueue_wait_ms),
            },
            rx: Arc::new(Mutex::new(rx)),
            worker_count: config.count.max(1),
            workers: Vec::new(),
            cancel: CancellationToken::new(),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }

    /// Spawn the workers. Call once.
    pub fn start_workers(&mut self, handler: Arc<dyn TaskHandler>) {
        for worker_id in 0..self.worker_count {
            let rx = Arc::clone(&self.rx);
            let handler = Arc::clone(&handler);
            let cancel = self.cancel.clone();
            self.workers.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, handler, cancel).await;
            }));
        }
        info!(count = self.worker_count, "worker pool started");
    }

    /// Convenience for the common case with no construction cycle.
    pub fn start(config: &WorkerConfig, handler: Arc<dyn TaskHandler>) -> Self {
        let mut pool = Self::new(config);
        pool.start_workers(handler);
        pool
    }

    pub fn queue(&self) -> TaskQueue {
        self.queue.clone()
    }

    /// Stop accepting work and wait for in-flight tasks, up to the grace
    /// window. Tasks still running after that are abandoned; their chunks
    /// remain `inbox` and are re-enqueued by the next startup scan.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let join_all = futures::future::join_all(self.workers.drain(..));
        if tokio::time::timeout(self.shutdown_grace, join_all).await.is_err() {
            warn!("worker pool shutdown grace expired; abandoning in-flight tasks");
        } else {
            info!("worker pool drained");
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    handler: Arc<dyn TaskHandler>,
    cancel: CancellationToken,
) {
    loop {
        let task = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                task = rx.recv() => task,
            }
        };
        let Some(task) = task else { break };

        debug!(worker_id, %task, "task started");
        if let Err(e) = handler.handle(task, &cancel).await {
            error!(worker_id, %task, "task failed: {e}");
        }
        if cancel.is_cancelled() {
            break;
        }
    }
    debug!(worker_id, "worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Counting {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Counting {
        async fn handle(&self, _task: Task, _cancel: &CancellationToken) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Parked {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl TaskHandler for Parked {
        async fn handle(&self, _task: Task, cancel: &CancellationToken) -> Result<()> {
            tokio::select! {
                _ = self.gate.notified() => {}
                _ = cancel.cancelled() => {}
            }
            Ok(())
        }
    }

    fn test_config(count: usize, capacity: usize) -> WorkerConfig {
        WorkerConfig {
            count,
            queue_capacity: capacity,
            enqueue_wait_ms: 50,
            shutdown_grace_secs: 2,
        }
    }

    #[tokio::test]
    async fn test_tasks_are_drained() {
        let handler = Arc::new(Counting {
            handled: AtomicUsize::new(0),
        });
        let pool = WorkerPool::start(&test_config(2, 16), Arc::clone(&handler) as _);
        let queue = pool.queue();
        for i in 0..8 {
            queue.enqueue(Task::ProcessChunk(Uuid::from_u128(i))).await.unwrap();
        }
        // Give the workers a moment, then shut down (which also drains).
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.shutdown().await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_backpressure_yields_queue_full() {
        let gate = Arc::new(Notify::new());
        let handler = Arc::new(Parked {
            gate: Arc::clone(&gate),
        });
        let pool = WorkerPool::start(&test_config(1, 2), handler as _);
        let queue = pool.queue();

        let mut accepted = 0;
        let mut rejected = 0;
        for i in 0..10 {
            match queue.enqueue(Task::ProcessChunk(Uuid::from_u128(i))).await {
                Ok(()) => accepted += 1,
                Err(Error::QueueFull) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        // One task can be in flight and two queued; everything else must
        // have been rejected by backpressure.
        assert!(accepted <= 4, "accepted {accepted}");
        assert!(rejected >= 6, "rejected {rejected}");

        gate.notify_waiters();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_parked_workers() {
        let gate = Arc::new(Notify::new());
        let handler = Arc::new(Parked { gate });
        let pool = WorkerPool::start(&test_config(2, 4), handler as _);
        pool.queue().enqueue(Task::ProcessChunk(Uuid::nil())).await.unwrap();
        // The parked handler listens for cancellation, so shutdown returns
        // inside the grace window.
        tokio::time::timeout(Duration::from_secs(3), pool.shutdown())
            .await
            .expect("shutdown hung");
    }
}
