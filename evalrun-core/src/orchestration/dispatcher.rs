//! Turns run bookkeeping into queued jobs.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::config::JobDefaults;
use super::ledger::NextStageDispatcher;
use super::queue::JobQueue;
use crate::error::{OrchestratorError, Result};
use crate::persistence::RunStore;
use crate::types::{
    JobPayload, JobType, ProbeJob, ProbeUnit, RunId, SendRequest, SummarizeJob, probe_queue_name,
};

/// Sends probe and summarize jobs with singleton keys derived from the unit,
/// so re-dispatching a unit that is still queued or running is merged by the
/// queue instead of duplicated.
#[derive(Clone)]
pub struct QueueDispatcher {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn JobQueue>,
    jobs: JobDefaults,
}

impl fmt::Debug for QueueDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDispatcher")
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

impl QueueDispatcher {
    pub fn new(store: Arc<dyn RunStore>, queue: Arc<dyn JobQueue>, jobs: JobDefaults) -> Self {
        Self { store, queue, jobs }
    }

    fn probe_request(&self, job: ProbeJob) -> SendRequest {
        let options = self
            .jobs
            .options(JobType::Probe)
            .with_singleton_key(job.singleton_key());
        SendRequest::new(JobPayload::Probe(job), options)
    }

    fn summarize_request(&self, job: SummarizeJob) -> SendRequest {
        let options = self
            .jobs
            .options(JobType::Summarize)
            .with_singleton_key(job.singleton_key());
        SendRequest::new(JobPayload::Summarize(job), options)
    }

    /// Enqueues a probe job per unit on its provider queue. Returns how many
    /// were newly queued; merged duplicates are not counted.
    pub async fn enqueue_probe_units(&self, run_id: RunId, units: &[ProbeUnit]) -> Result<usize> {
        let mut queued = 0;
        for unit in units {
            let job = ProbeJob::for_unit(run_id, unit);
            let queue = probe_queue_name(&job.provider);
            if self
                .queue
                .send(&queue, self.probe_request(job))
                .await?
                .is_some()
            {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Enqueues summarize jobs for the given units.
    pub async fn enqueue_summarize_units(
        &self,
        run_id: RunId,
        units: &[ProbeUnit],
    ) -> Result<usize> {
        let mut queued = 0;
        for unit in units {
            let job = SummarizeJob::for_unit(run_id, unit)
                .with_summary_model(self.jobs.summary_model.clone());
            let request = self.summarize_request(job);
            if self
                .queue
                .send(JobType::Summarize.as_str(), request)
                .await?
                .is_some()
            {
                queued += 1;
            }
        }
        Ok(queued)
    }
}

#[async_trait]
impl NextStageDispatcher for QueueDispatcher {
    async fn dispatch_summarization(&self, run_id: RunId) -> Result<u32> {
        let units = self.store.unsummarized_units(run_id).await?;
        let total = u32::try_from(units.len())
            .map_err(|_| OrchestratorError::Internal(format!("run {run_id} has too many units")))?;
        self.store.init_summarize_progress(run_id, total).await?;
        let queued = self.enqueue_summarize_units(run_id, &units).await?;
        tracing::debug!(
            target: "evalrun::ledger",
            run_id = %run_id,
            units = total,
            queued,
            "summarize jobs enqueued"
        );
        Ok(total)
    }
}
