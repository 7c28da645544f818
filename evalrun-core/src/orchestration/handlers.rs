//! Queue handlers for the probe and summarize stages.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::ledger::ProgressLedger;
use super::limiter::{LimiterRegistry, ScheduleContext};
use super::queue::JobHandler;
use crate::error::{OrchestratorError, Result};
use crate::persistence::RunStore;
use crate::types::{
    JobPayload, ProbeJob, ProbeOutcome, QueuedJob, RunStatus, SummarizeJob, UpstreamError,
};

/// Runs one probe conversation against the upstream provider.
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    async fn execute(&self, job: &ProbeJob) -> std::result::Result<(), UpstreamError>;
}

/// Produces the summary for one probed unit.
#[async_trait]
pub trait SummaryExecutor: Send + Sync {
    async fn summarize(&self, job: &SummarizeJob) -> std::result::Result<(), UpstreamError>;
}

/// Retryable failures go back to the queue while the job has attempts left;
/// anything else is recorded as a failed outcome.
fn settle_failure(job: &QueuedJob, err: OrchestratorError) -> Result<ProbeOutcome> {
    if err.is_retryable() && !job.is_final_attempt() {
        return Err(err);
    }
    tracing::warn!(
        queue = %job.queue_name,
        job = %job.id,
        attempt = job.attempt,
        "giving up on job: {err}"
    );
    Ok(ProbeOutcome::Failed)
}

pub struct ProbeJobHandler {
    store: Arc<dyn RunStore>,
    ledger: ProgressLedger,
    limiters: Arc<LimiterRegistry>,
    executor: Arc<dyn ProbeExecutor>,
}

impl fmt::Debug for ProbeJobHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeJobHandler")
            .field("limiters", &self.limiters)
            .finish_non_exhaustive()
    }
}

impl ProbeJobHandler {
    pub fn new(
        store: Arc<dyn RunStore>,
        ledger: ProgressLedger,
        limiters: Arc<LimiterRegistry>,
        executor: Arc<dyn ProbeExecutor>,
    ) -> Self {
        Self {
            store,
            ledger,
            limiters,
            executor,
        }
    }
}

#[async_trait]
impl JobHandler for ProbeJobHandler {
    async fn handle(&self, job: &QueuedJob) -> Result<()> {
        let JobPayload::Probe(probe) = &job.payload else {
            return Err(OrchestratorError::InvalidPayload(format!(
                "expected a probe job on {}, got {}",
                job.queue_name,
                job.payload.job_type()
            )));
        };

        // Paused runs leave the unit pending; resuming re-dispatches it.
        let status = self.store.read_run(probe.run_id).await?.status;
        if !status.accepts_probe_progress() {
            tracing::debug!(
                run_id = %probe.run_id,
                status = %status,
                model = %probe.model_id,
                scenario = %probe.scenario_id,
                "skipping probe for inactive run"
            );
            return Ok(());
        }

        let context = ScheduleContext {
            job_id: job.id,
            model_id: &probe.model_id,
            scenario_id: &probe.scenario_id,
        };
        let result = self
            .limiters
            .schedule(&probe.provider, context, async {
                self.executor
                    .execute(probe)
                    .await
                    .map_err(OrchestratorError::from)
            })
            .await;

        let outcome = match result {
            Ok(()) => ProbeOutcome::Succeeded,
            Err(err) => settle_failure(job, err)?,
        };
        self.ledger
            .record_probe_outcome(probe.run_id, &probe.unit(), outcome)
            .await?;
        Ok(())
    }

    async fn on_exhausted(&self, job: &QueuedJob, error: &OrchestratorError) -> Result<()> {
        tracing::warn!(
            queue = %job.queue_name,
            job = %job.id,
            attempt = job.attempt,
            "probe job abandoned: {error}"
        );
        self.ledger.record_abandoned_job(&job.payload).await?;
        Ok(())
    }
}

/// Summaries are written by a model too, so each call is scheduled on the
/// limiter of the provider serving the summary model.
pub struct SummarizeJobHandler {
    store: Arc<dyn RunStore>,
    ledger: ProgressLedger,
    limiters: Arc<LimiterRegistry>,
    executor: Arc<dyn SummaryExecutor>,
}

impl fmt::Debug for SummarizeJobHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummarizeJobHandler")
            .field("limiters", &self.limiters)
            .finish_non_exhaustive()
    }
}

impl SummarizeJobHandler {
    pub fn new(
        store: Arc<dyn RunStore>,
        ledger: ProgressLedger,
        limiters: Arc<LimiterRegistry>,
        executor: Arc<dyn SummaryExecutor>,
    ) -> Self {
        Self {
            store,
            ledger,
            limiters,
            executor,
        }
    }
}

#[async_trait]
impl JobHandler for SummarizeJobHandler {
    async fn handle(&self, job: &QueuedJob) -> Result<()> {
        let JobPayload::Summarize(summarize) = &job.payload else {
            return Err(OrchestratorError::InvalidPayload(format!(
                "expected a summarize job on {}, got {}",
                job.queue_name,
                job.payload.job_type()
            )));
        };

        let status = self.store.read_run(summarize.run_id).await?.status;
        if status != RunStatus::Summarizing {
            tracing::debug!(
                run_id = %summarize.run_id,
                status = %status,
                "skipping summarize job for run outside the summarize stage"
            );
            return Ok(());
        }

        let provider = summarize.summary_provider();
        let context = ScheduleContext {
            job_id: job.id,
            model_id: summarize.summary_model_id(),
            scenario_id: &summarize.scenario_id,
        };
        let result = self
            .limiters
            .schedule(provider, context, async {
                self.executor
                    .summarize(summarize)
                    .await
                    .map_err(OrchestratorError::from)
            })
            .await;

        let outcome = match result {
            Ok(()) => ProbeOutcome::Succeeded,
            Err(err) => settle_failure(job, err)?,
        };
        self.ledger
            .record_summary_outcome(summarize.run_id, &summarize.unit(), outcome)
            .await?;
        Ok(())
    }

    async fn on_exhausted(&self, job: &QueuedJob, error: &OrchestratorError) -> Result<()> {
        tracing::warn!(
            queue = %job.queue_name,
            job = %job.id,
            attempt = job.attempt,
            "summarize job abandoned: {error}"
        );
        self.ledger.record_abandoned_job(&job.payload).await?;
        Ok(())
    }
}
