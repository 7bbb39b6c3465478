//! Executors that carry out deferred transfer work.
//!
//! Non-blocking transfers hand their copy work to a [`DeviceExecutor`],
//! standing in for the copy engine of an accelerator. Jobs may run in any
//! order; ordering between them is established by the sync engine, never
//! by the executor.

use crate::config::core::{ExecutorKind, RuntimeConfig};
use crate::core::error::{Result, SymHeapError};

use std::fmt;

/// Unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs transfer jobs.
pub trait DeviceExecutor: Send + Sync + fmt::Debug {
    /// Queue `job` for execution.
    fn submit(&self, job: Job);

    /// Number of worker threads (0 for inline execution).
    fn num_threads(&self) -> usize;
}

/// Runs every job on the submitting thread before `submit` returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl DeviceExecutor for InlineExecutor {
    fn submit(&self, job: Job) {
        job();
    }

    fn num_threads(&self) -> usize {
        0
    }
}

/// Runs jobs out of order on a dedicated `rayon` thread pool.
pub struct PoolExecutor {
    pool: rayon::ThreadPool,
}

impl PoolExecutor {
    /// Pool with `num_threads` workers.
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("symheap-copy-{}", i))
            .build()
            .map_err(|e| SymHeapError::internal(format!("failed to build executor pool: {}", e)))?;
        Ok(PoolExecutor { pool })
    }
}

impl fmt::Debug for PoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolExecutor")
            .field("num_threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl DeviceExecutor for PoolExecutor {
    fn submit(&self, job: Job) {
        self.pool.spawn(job);
    }

    fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// Build the executor selected by `config`.
pub fn executor_from_config(config: &RuntimeConfig) -> Result<Box<dyn DeviceExecutor>> {
    match config.executor {
        ExecutorKind::Inline => Ok(Box::new(InlineExecutor)),
        ExecutorKind::Pool => Ok(Box::new(PoolExecutor::new(
            config.effective_executor_threads(),
        )?)),
    }
}
