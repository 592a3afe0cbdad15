use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::runner::result::panic_message;

/// Why a pooled task produced no result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The task was cancelled; whatever it returned is discarded.
    #[error("Worker terminated")]
    WorkerTerminated,
    /// The pool was shut down before or while the task ran.
    #[error("Pool terminated")]
    PoolTerminated,
    /// The task panicked.
    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl PoolError {
    /// Lifecycle errors are fallout from cancellation and are never reported
    /// as test results.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::WorkerTerminated | Self::PoolTerminated)
    }
}

/// A bounded pool of workers.
///
/// At most `size` tasks run at once; the rest wait for a slot. Each task runs
/// on its own tokio task so a panic is contained to it.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    size: usize,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Self {
        let size = size.max(1);
        debug!(pool = name, size, "starting worker pool");
        Self {
            name: Arc::from(name),
            size,
            slots: Arc::new(Semaphore::new(size)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently holding a slot.
    pub fn busy(&self) -> usize {
        self.size - self.slots.available_permits().min(self.size)
    }

    pub fn is_terminated(&self) -> bool {
        self.slots.is_closed()
    }

    /// Run `task` on a free worker.
    ///
    /// Cancelling `cancel` while the task waits for a slot abandons it. Once
    /// running, the task is expected to notice `cancel` itself and return;
    /// its result is then discarded. A forced [`terminate`](Self::terminate)
    /// aborts the task outright.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] if the task was cancelled, the pool shut down,
    /// or the task panicked.
    pub async fn exec<F, T>(&self, cancel: &CancellationToken, task: F) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(PoolError::PoolTerminated),
            _ = cancel.cancelled() => return Err(PoolError::WorkerTerminated),
            slot = Arc::clone(&self.slots).acquire_owned() => {
                slot.map_err(|_| PoolError::PoolTerminated)?
            }
        };

        let mut handle = tokio::spawn(task);
        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = self.shutdown.cancelled() => {
                handle.abort();
                drop(slot);
                return Err(PoolError::PoolTerminated);
            }
        };
        drop(slot);

        match joined {
            Ok(_) if cancel.is_cancelled() => Err(PoolError::WorkerTerminated),
            Ok(value) => Ok(value),
            Err(e) if e.is_panic() => Err(PoolError::Panicked(panic_message(&*e.into_panic()))),
            Err(_) => Err(PoolError::WorkerTerminated),
        }
    }

    /// Stop accepting tasks. With `force`, in-flight tasks are aborted too;
    /// otherwise they run to completion.
    pub fn terminate(&self, force: bool) {
        if !self.slots.is_closed() {
            debug!(pool = %self.name, force, "terminating worker pool");
        }
        self.slots.close();
        if force {
            self.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn exec_returns_task_value() {
        let pool = WorkerPool::new("test", 2);
        let value = pool.exec(&CancellationToken::new(), async { 41 + 1 }).await;
        assert_eq!(value, Ok(42));
        assert_eq!(pool.busy(), 0);
    }

    #[tokio::test]
    async fn zero_size_is_clamped() {
        assert_eq!(WorkerPool::new("test", 0).size(), 1);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = WorkerPool::new("test", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                pool.exec(&CancellationToken::new(), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            assert!(joined.unwrap().is_ok());
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_is_worker_terminated() {
        let pool = WorkerPool::new("test", 1);
        let token = CancellationToken::new();
        token.cancel();
        let result = pool.exec(&token, async { 1 }).await;
        assert_eq!(result, Err(PoolError::WorkerTerminated));
    }

    #[tokio::test]
    async fn result_of_cancelled_task_is_discarded() {
        let pool = WorkerPool::new("test", 1);
        let token = CancellationToken::new();
        let inner = token.clone();
        let result = pool
            .exec(&token, async move {
                inner.cancel();
                "finished anyway"
            })
            .await;
        assert_eq!(result, Err(PoolError::WorkerTerminated));
    }

    #[tokio::test]
    async fn panic_is_reported() {
        let pool = WorkerPool::new("test", 1);
        let result: Result<(), _> = pool
            .exec(&CancellationToken::new(), async { panic!("kaboom") })
            .await;
        assert_eq!(result, Err(PoolError::Panicked("kaboom".into())));
    }

    #[tokio::test]
    async fn graceful_terminate_rejects_new_tasks() {
        let pool = WorkerPool::new("test", 1);
        pool.terminate(false);
        assert!(pool.is_terminated());
        let result = pool.exec(&CancellationToken::new(), async { 1 }).await;
        assert_eq!(result, Err(PoolError::PoolTerminated));
    }

    #[tokio::test]
    async fn forced_terminate_aborts_running_task() {
        let pool = WorkerPool::new("test", 1);
        let runner = pool.clone();
        let handle = tokio::spawn(async move {
            runner
                .exec(&CancellationToken::new(), async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.terminate(true);
        assert_eq!(handle.await.unwrap(), Err(PoolError::PoolTerminated));
    }

    #[test]
    fn lifecycle_errors() {
        assert!(PoolError::WorkerTerminated.is_lifecycle());
        assert!(PoolError::PoolTerminated.is_lifecycle());
        assert!(!PoolError::Panicked("x".into()).is_lifecycle());
        assert_eq!(PoolError::WorkerTerminated.to_string(), "Worker terminated");
        assert_eq!(PoolError::PoolTerminated.to_string(), "Pool terminated");
    }
}
