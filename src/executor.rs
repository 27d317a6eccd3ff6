//! # Execution Resources
//!
//! The event-loop runtime that drives dispatcher and bridge I/O, and a
//! bounded secondary pool for work that would otherwise block one of its
//! workers. The pool admits at most `blocking_workers` running jobs plus
//! `blocking_queue_capacity` waiting ones; anything beyond that is refused
//! with `Backpressure` instead of queueing without bound.
//!
//! ```rust
//! use zephyr_core::config::ExecutorConfig;
//! use zephyr_core::executor::BlockingPool;
//!
//! # tokio_test::block_on(async {
//! let pool = BlockingPool::new(&ExecutorConfig::default());
//! let length = pool.run(|| "expensive".len()).await.unwrap();
//! assert_eq!(length, 9);
//! # });
//! ```

use crate::config::ExecutorConfig;
use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Build the multi-threaded event-loop runtime
pub fn build_runtime(config: &ExecutorConfig) -> CoreResult<tokio::runtime::Runtime> {
    info!(
        event_loop_workers = config.event_loop_workers,
        blocking_workers = config.blocking_workers,
        "Building event-loop runtime"
    );
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(config.event_loop_workers)
        .thread_name("zephyr-event-loop")
        .build()
        .map_err(|e| CoreError::Internal(format!("failed to build runtime: {e}")))
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockingPoolStats {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Jobs admitted and not yet finished, running or waiting
    pub in_flight: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub panicked: u64,
}

/// Bounded pool for blocking work
#[derive(Clone)]
pub struct BlockingPool {
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    worker_count: usize,
    queue_capacity: usize,
    counters: Arc<PoolCounters>,
}

impl fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingPool")
            .field("workers", &self.worker_count)
            .field("queue_capacity", &self.queue_capacity)
            .field("available_admissions", &self.admission.available_permits())
            .finish()
    }
}

impl BlockingPool {
    pub fn new(config: &ExecutorConfig) -> Self {
        let worker_count = config.blocking_workers.max(1);
        Self {
            admission: Arc::new(Semaphore::new(worker_count + config.blocking_queue_capacity)),
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            queue_capacity: config.blocking_queue_capacity,
            counters: Arc::new(PoolCounters::default()),
        }
    }

    /// Queue `job`, failing fast with `Backpressure` when the pool is full
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F, T>(&self, job: F) -> CoreResult<BlockingJob<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let admitted = match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(CoreError::Backpressure("blocking pool closed".to_string()));
            }
            Err(TryAcquireError::NoPermits) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    workers = self.worker_count,
                    queue_capacity = self.queue_capacity,
                    "Blocking pool full, rejecting job"
                );
                return Err(CoreError::Backpressure(format!(
                    "blocking pool full ({} workers, {} queued)",
                    self.worker_count, self.queue_capacity
                )));
            }
        };
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let workers = Arc::clone(&self.workers);
        let counters = Arc::clone(&self.counters);
        let handle = tokio::spawn(async move {
            let _admitted = admitted;
            let _worker = workers
                .acquire_owned()
                .await
                .map_err(|_| CoreError::Internal("blocking pool closed".to_string()))?;

            match tokio::task::spawn_blocking(job).await {
                Ok(value) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    Ok(value)
                }
                Err(e) => {
                    counters.panicked.fetch_add(1, Ordering::Relaxed);
                    Err(CoreError::Internal(format!("blocking job failed: {e}")))
                }
            }
        });

        Ok(BlockingJob { handle })
    }

    /// Submit and wait for the result
    pub async fn run<F, T>(&self, job: F) -> CoreResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.submit(job)?.wait().await
    }

    pub fn stats(&self) -> BlockingPoolStats {
        let capacity = self.worker_count + self.queue_capacity;
        BlockingPoolStats {
            workers: self.worker_count,
            queue_capacity: self.queue_capacity,
            in_flight: capacity.saturating_sub(self.admission.available_permits()),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }

    /// Refuse new jobs; admitted jobs still waiting for a worker fail
    pub fn close(&self) {
        debug!("Closing blocking pool");
        self.admission.close();
        self.workers.close();
    }
}

/// Handle to a submitted job
#[derive(Debug)]
pub struct BlockingJob<T> {
    handle: JoinHandle<CoreResult<T>>,
}

impl<T> BlockingJob<T> {
    pub async fn wait(self) -> CoreResult<T> {
        self.handle
            .await
            .map_err(|e| CoreError::Internal(format!("blocking job aborted: {e}")))?
    }
}
