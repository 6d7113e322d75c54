//! Bounded worker pools isolating blocking and CPU-heavy work.
//!
//! HTTP and SMTP handlers never run database or signature work inline;
//! they enqueue it on one of three fixed-size pools and wait on a channel
//! with their own deadline. Submission fails fast when a queue is full,
//! so a flooded pool degrades into rejected work instead of back-pressure
//! on the network front-end.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Upper bound on a single task's execution; runaway tasks are dropped.
const TASK_GUARD_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `close` waits for workers to finish draining.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker pool queue full")]
    QueueFull,
    #[error("worker pool closed")]
    PoolClosed,
}

type Task = BoxFuture<'static, ()>;

/// A named pool of workers draining a bounded queue.
pub struct Pool {
    name: &'static str,
    queue: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(name: &'static str, size: usize, queue_cap: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_cap.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..size.max(1))
            .map(|id| tokio::spawn(Self::worker_loop(name, id, Arc::clone(&rx))))
            .collect();

        Self {
            name,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    async fn worker_loop(
        name: &'static str,
        id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    ) {
        loop {
            // Lock only to pull the next task; execution happens unlocked
            // so workers actually run in parallel.
            let task = { rx.lock().await.recv().await };
            let Some(task) = task else {
                // Queue closed and drained.
                return;
            };

            let guarded = tokio::time::timeout(
                TASK_GUARD_TIMEOUT,
                std::panic::AssertUnwindSafe(task).catch_unwind(),
            );
            match guarded.await {
                Ok(Ok(())) => {}
                Ok(Err(_panic)) => {
                    tracing::error!(pool = name, worker = id, "recovered from task panic");
                }
                Err(_) => {
                    tracing::warn!(pool = name, worker = id, "task exceeded guard deadline");
                }
            }
        }
    }

    /// Enqueues a task without blocking.
    pub fn submit<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return Err(SubmitError::PoolClosed);
        };
        tx.try_send(task.boxed()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!(pool = self.name, "queue full, dropping task");
                SubmitError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => SubmitError::PoolClosed,
        })
    }

    /// Closes the queue, lets workers drain what was already accepted, and
    /// waits for them bounded by five seconds. Idempotent.
    pub async fn close(&self) {
        drop(self.queue.lock().take());
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }

        if tokio::time::timeout(CLOSE_TIMEOUT, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(pool = self.name, "shutdown timed out with tasks still running");
        }
    }
}

/// Runs `task` on its own tokio task and reports whether it finished
/// within `deadline`. On timeout the task is abandoned, not aborted: the
/// caller moves on while the work completes (and is discarded) in the
/// background. The right call when the inner operation cannot observe
/// cancellation anyway.
pub async fn run_with_timeout<F>(deadline: Duration, task: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(task);
    tokio::time::timeout(deadline, handle).await.is_ok()
}

/// Separate pools for database, signature, and SMTP work, so a stall in
/// one class of work cannot starve the others.
pub struct WorkManager {
    db: Pool,
    crypto: Pool,
    smtp: Pool,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkManagerConfig {
    pub db_workers: usize,
    pub crypto_workers: usize,
    pub smtp_workers: usize,
    pub queue_size: usize,
}

impl Default for WorkManagerConfig {
    fn default() -> Self {
        Self {
            db_workers: 4,
            crypto_workers: 4,
            smtp_workers: 2,
            queue_size: 1024,
        }
    }
}

impl WorkManager {
    pub fn new(config: WorkManagerConfig) -> Self {
        Self {
            db: Pool::new("db", config.db_workers, config.queue_size),
            crypto: Pool::new("crypto", config.crypto_workers, config.queue_size),
            smtp: Pool::new("smtp", config.smtp_workers, config.queue_size),
        }
    }

    pub fn submit_db<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.db.submit(task)
    }

    pub fn submit_crypto<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.crypto.submit(task)
    }

    pub fn submit_smtp<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.smtp.submit(task)
    }

    pub async fn close(&self) {
        self.db.close().await;
        self.crypto.close().await;
        self.smtp.close().await;
    }
}

impl Default for WorkManager {
    fn default() -> Self {
        Self::new(WorkManagerConfig::default())
    }
}
