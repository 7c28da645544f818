//! Durable job queue seam consumed by the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::types::{JobId, QueuedJob, RunId, SendRequest};

pub mod memory;
pub mod worker;

pub use memory::InMemoryJobQueue;
pub use worker::{JobSource, WorkerHandle, WorkerSet};

/// Processes one delivered job. Returning an error hands the job back to the
/// queue, which retries it per its [`crate::types::JobOptions`].
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueuedJob) -> Result<()>;

    /// Called after the queue marks a job failed for good without `handle`
    /// having settled it: the final attempt errored, panicked, or ran past
    /// its lease.
    async fn on_exhausted(&self, _job: &QueuedJob, _error: &OrchestratorError) -> Result<()> {
        Ok(())
    }
}

/// Live job counts for a queue or a run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueOccupancy {
    pub active: usize,
    pub queued: usize,
}

impl QueueOccupancy {
    pub fn is_idle(&self) -> bool {
        self.active == 0 && self.queued == 0
    }
}

/// Abstracts the queue backend (persistence + delivery). Delivery is
/// at-least-once; handlers must tolerate duplicates.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn create_queue(&self, name: &str) -> Result<()>;

    /// Attaches a worker that keeps at most `batch_size` jobs of `queue` in
    /// flight at once.
    async fn register_worker(
        &self,
        queue: &str,
        batch_size: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()>;

    /// Stops pulling new jobs for `queue`. Jobs already handed to the worker
    /// run to completion.
    async fn deregister_worker(&self, queue: &str) -> Result<()>;

    /// Returns `None` when a job with the same singleton key is already
    /// queued or active on `queue`.
    async fn send(&self, queue: &str, request: SendRequest) -> Result<Option<JobId>>;

    async fn occupancy(&self, queue: &str) -> Result<QueueOccupancy>;

    /// Active and queued jobs across all queues whose payload belongs to `run_id`.
    async fn run_occupancy(&self, run_id: RunId) -> Result<QueueOccupancy>;

    /// Stops every worker and waits for the jobs they already started.
    async fn shutdown(&self) {}

    /// Default implementation sends jobs one by one.
    async fn send_many(
        &self,
        queue: &str,
        requests: Vec<SendRequest>,
    ) -> Result<Vec<Option<JobId>>> {
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            out.push(self.send(queue, request).await?);
        }
        Ok(out)
    }
}
