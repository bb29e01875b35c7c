//! Background execution of ingest runs.
//!
//! This module sits below [`crate::ingestion::IngestionCoordinator`] and provides:
//!
//! - A worker pool that runs each ingest as one fire-and-forget task
//! - The in-process progress table polled by status queries
//! - Aggregate counters across runs

mod metrics;
mod progress;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{IngestionError, IngestionResult};

pub use metrics::{IngestMetrics, IngestMetricsSnapshot};
pub use progress::{IngestState, ProgressSnapshot, ProgressTable, percent};

/// Thread pool hosting ingest runs.
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    /// Build a pool with `num_threads` workers, or the platform's available parallelism.
    pub fn new(num_threads: Option<usize>) -> IngestionResult<Self> {
        if num_threads == Some(0) {
            return Err(IngestionError::InvalidSetting {
                name: "workers".to_string(),
                message: "must be > 0".to_string(),
            });
        }
        let n_threads = num_threads
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
            .max(1);

        let pool = ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .thread_name(|i| format!("ingest-worker-{i}"))
            .build()
            .map_err(|e| IngestionError::InvalidSetting {
                name: "workers".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { pool })
    }

    /// Queue a task and return immediately.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(job);
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads())
            .finish()
    }
}
