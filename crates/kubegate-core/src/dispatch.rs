//! Bounded worker pool used by backends to run message handlers.
//!
//! A drain loop submits one job per delivery. Jobs wait in a bounded
//! backlog; when the backlog is full `submit` blocks, which stops the drain
//! from pulling more messages off the broker.

use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

use crate::{
    Message,
    traits::{HandlerResult, MessageHandler, QueueError},
};

/// Default number of concurrent handlers per drain.
pub const DEFAULT_WORKERS: usize = 8;

/// Default number of messages waiting for a free worker.
pub const DEFAULT_BACKLOG: usize = 64;

/// Unit of work executed by the pool.
pub type Job = BoxFuture<'static, ()>;

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Handlers running at the same time.
    pub workers: usize,
    /// Jobs queued behind busy workers.
    pub backlog: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration.
    #[must_use]
    pub const fn new(workers: usize, backlog: usize) -> Self {
        Self { workers, backlog }
    }

    /// Maximum number of unacknowledged deliveries a broker should push to
    /// one consumer.
    #[must_use]
    pub fn prefetch(&self) -> u16 {
        u16::try_from(self.workers.max(1) + self.backlog.max(1)).unwrap_or(u16::MAX)
    }
}

/// Fixed set of worker tasks pulling jobs from a bounded backlog.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the workers. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.backlog.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..config.workers.max(1))
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&rx))))
            .collect();

        Self { tx, workers }
    }

    /// Queue a job, waiting while the backlog is full.
    ///
    /// # Errors
    /// Returns error if every worker has exited.
    pub async fn submit(&self, job: Job) -> Result<(), QueueError> {
        self.tx
            .send(job)
            .await
            .map_err(|_| QueueError::Handler("worker pool is shut down".to_string()))
    }

    /// Stop accepting jobs and wait until queued and running jobs finish.
    pub async fn shutdown(self) {
        let Self { tx, workers } = self;
        drop(tx);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Worker task failed: {e}");
            }
        }
    }
}

async fn worker_loop(id: usize, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };
        // Run on its own task so a panicking job cannot take the worker down.
        if let Err(e) = tokio::spawn(job).await {
            tracing::error!(worker = id, "Job aborted: {e}");
        }
    }
    tracing::trace!(worker = id, "Worker exiting");
}

/// Invoke a handler, turning a panic into a handler error.
pub async fn run_handler(handler: &MessageHandler, message: Message) -> HandlerResult {
    match AssertUnwindSafe(handler(message)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(QueueError::Handler("handler panicked".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::traits::handler_fn;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(PoolConfig::new(2, 4));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            pool.submit(Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        }

        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_worker() {
        let pool = WorkerPool::new(PoolConfig::new(1, 1));
        let done = Arc::new(AtomicUsize::new(0));

        pool.submit(Box::pin(async { panic!("boom") })).await.unwrap();
        let counter = Arc::clone(&done);
        pool.submit(Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_handler_catches_panic() {
        let handler = handler_fn(|msg: Message| async move {
            if msg.body == "explode" {
                panic!("handler blew up");
            }
            Ok(())
        });

        tokio_test::assert_ok!(run_handler(&handler, Message::response("fine", "1")).await);
        let err = run_handler(&handler, Message::response("explode", "2"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Handler(_)));
    }

    #[test]
    fn test_prefetch_saturates() {
        assert_eq!(PoolConfig::new(8, 64).prefetch(), 72);
        assert_eq!(PoolConfig::new(usize::MAX / 2, 70_000).prefetch(), u16::MAX);
    }
}
