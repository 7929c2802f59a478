//! Bounded task pool
//!
//! A runtime handle plus a semaphore. Every task spawned through the pool
//! holds one permit for its whole life, so at most `size` relay tasks run at
//! once no matter how many sessions are open.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::settings::MIN_WORKER_POOL_SIZE;

#[derive(Clone, Debug)]
pub struct WorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Sizes below the minimum are raised to it.
    pub fn new(handle: Handle, size: usize) -> Self {
        let size = size.max(MIN_WORKER_POOL_SIZE);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a task
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.handle.spawn(async move {
            // The semaphore is never closed, so acquire only fails if it is
            let _permit = permits.acquire_owned().await.ok();
            future.await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_size_has_a_floor() {
        let pool = WorkerPool::new(Handle::current(), 1);
        assert_eq!(pool.size(), MIN_WORKER_POOL_SIZE);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(Handle::current(), 3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.available(), 3);
    }
}
