//! Bounded pool for execution attempts and pipelines.
//!
//! The `WorkerPool` runs futures on the tokio runtime while capping how many
//! make progress at once. The scheduler's own concurrency limit applies to
//! executions only; this pool bounds executions and pipelines together.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::flog_debug;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    /// Create a pool. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Permits not currently held by a running job.
    fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Submit a job. It starts as soon as a permit is free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] once [`WorkerPool::close`] was called.
    /// A job still waiting for a permit at close time resolves to the same
    /// error without running.
    pub fn spawn<F, T>(&self, job: F) -> Result<JoinHandle<Result<T>>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        let permits = self.permits.clone();
        Ok(tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| Error::PoolClosed)?;
            Ok(job.await)
        }))
    }

    /// Stop accepting work. Running jobs finish; queued ones are abandoned.
    pub fn close(&self) {
        flog_debug!(
            "Closing worker pool ({} of {} permits free)",
            self.available(),
            self.capacity
        );
        self.permits.close();
    }
}
