//! C1: the bounded-concurrency worker pool. `execute_batch` runs up to
//! `concurrency` tasks at once, enforces a per-task timeout, and preserves
//! the caller's ordering in the returned `Vec` — a panicking or timed-out
//! task contributes `None` at its slot rather than failing the batch.
//! Concurrency is supplied per call rather than fixed at construction,
//! since each request picks its own fan-out width from its channel/plugin
//! count.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::warn;

pub struct WorkerPool {
    task_timeout: Duration,
}

impl WorkerPool {
    pub fn new(task_timeout: Duration) -> Self {
        Self { task_timeout }
    }

    /// Runs every task in `tasks` under a concurrency bound built fresh for
    /// this call, returning one `Option<T>` per task in the same order they
    /// were given. A task that times out, is cancelled, or panics yields
    /// `None` for its slot; it never aborts the rest of the batch.
    pub async fn execute_batch<F, Fut, T>(&self, tasks: Vec<F>, concurrency: usize) -> Vec<Option<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let semaphore = semaphore.clone();
            let task_timeout = self.task_timeout;
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                tokio::time::timeout(task_timeout, task()).await
            });
            handles.push(handle);
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = match handle.await {
                Ok(Ok(value)) => Some(value),
                Ok(Err(_elapsed)) => {
                    warn!("worker pool task timed out");
                    None
                }
                Err(join_err) => {
                    warn!(error = %join_err, "worker pool task panicked or was cancelled");
                    None
                }
            };
            results.push(result);
        }
        results
    }
}
