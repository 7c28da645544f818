//! Progress counters and the run status state machine.
//!
//! All counter mutations go through [`RunStore::conditional_increment`] so
//! concurrent workers never read-modify-write a run. Status changes are
//! compare-and-set writes; only the caller that wins the write performs the
//! side effects of the transition.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::persistence::{IncrementOutcome, RunStore};
use crate::types::{
    JobPayload, ProbeOutcome, ProbeUnit, ProgressDelta, ProgressState, RunId, RunProgress,
    RunStatus, SummaryOutcome,
};

const MAX_TRANSITION_ATTEMPTS: usize = 8;

/// Starts the stage that follows probing. Injected so the ledger never
/// depends on the queue layer directly.
#[async_trait]
pub trait NextStageDispatcher: Send + Sync {
    /// Initializes summarize progress and enqueues one summarize job per
    /// succeeded unit without a summary. Returns how many units need one.
    async fn dispatch_summarization(&self, run_id: RunId) -> Result<u32>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub status: RunStatus,
    pub progress: RunProgress,
    pub percent_complete: u32,
    pub summarize_progress: Option<RunProgress>,
}

/// Derives the status implied by `progress`. Terminal and SUMMARIZING
/// statuses are sticky; a finished PAUSED run moves on to SUMMARIZING.
pub fn determine_status(progress: &RunProgress, current: RunStatus) -> RunStatus {
    if current.is_terminal() || current == RunStatus::Summarizing {
        return current;
    }
    if progress.is_finished() {
        return RunStatus::Summarizing;
    }
    if current == RunStatus::Pending && progress.processed() > 0 {
        return RunStatus::Running;
    }
    current
}

/// `round(100 * processed / total)`; a run with no work counts as complete.
pub fn calculate_percent_complete(progress: &RunProgress) -> u32 {
    if progress.total == 0 {
        return 100;
    }
    let processed = u64::from(progress.processed());
    let total = u64::from(progress.total);
    let percent = (200 * processed + total) / (2 * total);
    u32::try_from(percent).unwrap_or(u32::MAX)
}

#[derive(Clone)]
pub struct ProgressLedger {
    store: Arc<dyn RunStore>,
    dispatcher: Arc<dyn NextStageDispatcher>,
}

impl fmt::Debug for ProgressLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressLedger").finish_non_exhaustive()
    }
}

impl ProgressLedger {
    pub fn new(store: Arc<dyn RunStore>, dispatcher: Arc<dyn NextStageDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Counter-only progress for callers that do not know which unit
    /// finished. The store hands each increment to a pending unit, so
    /// recovery and the summarize stage see the same totals as the counters.
    pub async fn update_progress(
        &self,
        run_id: RunId,
        delta: ProgressDelta,
    ) -> Result<ProgressState> {
        if delta.is_empty() {
            return Ok(self.store.read_run(run_id).await?.state());
        }

        let outcome = self.store.conditional_increment(run_id, delta).await?;
        self.after_probe_increment(run_id, outcome).await
    }

    /// Records a unit's probe outcome and counts it in one atomic step. A
    /// unit that already has an outcome is absorbed without counting.
    pub async fn record_probe_outcome(
        &self,
        run_id: RunId,
        unit: &ProbeUnit,
        outcome: ProbeOutcome,
    ) -> Result<ProgressState> {
        let result = self
            .store
            .record_probe_outcome(run_id, unit, outcome)
            .await?;
        self.after_probe_increment(run_id, result).await
    }

    async fn after_probe_increment(
        &self,
        run_id: RunId,
        outcome: IncrementOutcome,
    ) -> Result<ProgressState> {
        if !outcome.applied {
            tracing::debug!(
                target: "evalrun::ledger",
                run_id = %run_id,
                status = %outcome.state.status,
                "ignored stale or duplicate completion"
            );
            return Ok(outcome.state);
        }

        let ProgressState { progress, status } = outcome.state;
        let status = self.advance_probe_stage(run_id, status, progress).await?;
        Ok(ProgressState { progress, status })
    }

    /// Applies the transition `progress` implies. A lost compare-and-set is
    /// followed by a re-read, since the winner may have made a smaller step
    /// (PENDING -> RUNNING) than the one still due.
    async fn advance_probe_stage(
        &self,
        run_id: RunId,
        mut status: RunStatus,
        mut progress: RunProgress,
    ) -> Result<RunStatus> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let next = determine_status(&progress, status);
            if next == status {
                return Ok(status);
            }
            if self.store.transition_status(run_id, status, next).await? {
                return self.on_transition(run_id, status, next).await;
            }
            let run = self.store.read_run(run_id).await?;
            tracing::debug!(
                target: "evalrun::ledger",
                run_id = %run_id,
                from = %status,
                to = %next,
                current = %run.status,
                "lost status transition race"
            );
            status = run.status;
            progress = run.progress;
        }
        Ok(status)
    }

    pub async fn increment_completed(&self, run_id: RunId) -> Result<ProgressState> {
        self.update_progress(run_id, ProgressDelta::COMPLETED).await
    }

    pub async fn increment_failed(&self, run_id: RunId) -> Result<ProgressState> {
        self.update_progress(run_id, ProgressDelta::FAILED).await
    }

    /// Counts a job the queue gave up on as a failed outcome of its unit, in
    /// whichever stage the job belongs to. Job types without a unit are
    /// ignored. A unit that already has an outcome absorbs the report.
    pub async fn record_abandoned_job(
        &self,
        payload: &JobPayload,
    ) -> Result<Option<ProgressState>> {
        let state = match payload {
            JobPayload::Probe(probe) => {
                self.record_probe_outcome(probe.run_id, &probe.unit(), ProbeOutcome::Failed)
                    .await?
            }
            JobPayload::Summarize(summarize) => {
                self.record_summary_outcome(
                    summarize.run_id,
                    &summarize.unit(),
                    ProbeOutcome::Failed,
                )
                .await?
            }
            _ => return Ok(None),
        };
        tracing::info!(
            target: "evalrun::ledger",
            run_id = ?payload.run_id(),
            job_type = %payload.job_type(),
            status = %state.status,
            "abandoned job counted as failed"
        );
        Ok(Some(state))
    }

    pub async fn get_progress(&self, run_id: RunId) -> Result<ProgressReport> {
        let run = self.store.read_run(run_id).await?;
        Ok(ProgressReport {
            status: run.status,
            progress: run.progress,
            percent_complete: calculate_percent_complete(&run.progress),
            summarize_progress: run.summarize_progress,
        })
    }

    /// Summarize-stage counterpart of [`Self::update_progress`]. Only applies
    /// while the run is SUMMARIZING and completes the run once every
    /// summarize job has reported.
    pub async fn update_summarize_progress(
        &self,
        run_id: RunId,
        delta: ProgressDelta,
    ) -> Result<ProgressState> {
        if delta.is_empty() {
            let run = self.store.read_run(run_id).await?;
            return Ok(ProgressState {
                progress: run.summarize_progress.unwrap_or_default(),
                status: run.status,
            });
        }

        let outcome = self
            .store
            .conditional_increment_summarize(run_id, delta)
            .await?;
        self.after_summarize_increment(run_id, outcome).await
    }

    pub async fn record_summary_outcome(
        &self,
        run_id: RunId,
        unit: &ProbeUnit,
        outcome: SummaryOutcome,
    ) -> Result<ProgressState> {
        let result = self
            .store
            .record_summary_outcome(run_id, unit, outcome)
            .await?;
        self.after_summarize_increment(run_id, result).await
    }

    async fn after_summarize_increment(
        &self,
        run_id: RunId,
        outcome: IncrementOutcome,
    ) -> Result<ProgressState> {
        if !outcome.applied {
            tracing::debug!(
                target: "evalrun::ledger",
                run_id = %run_id,
                status = %outcome.state.status,
                "ignored stale summarize completion"
            );
            return Ok(outcome.state);
        }

        let ProgressState { progress, status } = outcome.state;
        if status == RunStatus::Summarizing && progress.is_finished() {
            let status = self
                .apply_transition(run_id, RunStatus::Summarizing, RunStatus::Completed)
                .await?;
            return Ok(ProgressState { progress, status });
        }
        Ok(outcome.state)
    }

    /// Re-derives the status from stored progress and applies any transition
    /// that is due. Returns the new status when one was applied.
    pub async fn reconcile_status(&self, run_id: RunId) -> Result<Option<RunStatus>> {
        let run = self.store.read_run(run_id).await?;
        match run.status {
            RunStatus::Pending | RunStatus::Running | RunStatus::Paused => {
                let status = self
                    .advance_probe_stage(run_id, run.status, run.progress)
                    .await?;
                Ok((status != run.status).then_some(status))
            }
            RunStatus::Summarizing => match run.summarize_progress {
                None => {
                    tracing::info!(
                        target: "evalrun::ledger",
                        run_id = %run_id,
                        "summarize stage was never dispatched; dispatching"
                    );
                    self.enter_summarizing(run_id).await.map(Some)
                }
                Some(progress) if progress.is_finished() => self
                    .apply_transition(run_id, RunStatus::Summarizing, RunStatus::Completed)
                    .await
                    .map(Some),
                Some(_) => Ok(None),
            },
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => Ok(None),
        }
    }

    async fn apply_transition(
        &self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<RunStatus> {
        if !self.store.transition_status(run_id, from, to).await? {
            // Another writer moved the run first and owns the side effects.
            let current = self.store.read_run(run_id).await?.status;
            tracing::debug!(
                target: "evalrun::ledger",
                run_id = %run_id,
                from = %from,
                to = %to,
                current = %current,
                "lost status transition race"
            );
            return Ok(current);
        }
        self.on_transition(run_id, from, to).await
    }

    /// Side effects owed by the writer that won a transition.
    async fn on_transition(
        &self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<RunStatus> {
        tracing::info!(
            target: "evalrun::ledger",
            run_id = %run_id,
            from = %from,
            to = %to,
            "run status changed"
        );

        if to == RunStatus::Summarizing {
            return self.enter_summarizing(run_id).await;
        }
        Ok(to)
    }

    async fn enter_summarizing(&self, run_id: RunId) -> Result<RunStatus> {
        let queued = self.dispatcher.dispatch_summarization(run_id).await?;
        if queued > 0 {
            tracing::info!(
                target: "evalrun::ledger",
                run_id = %run_id,
                summarize_jobs = queued,
                "summarize stage dispatched"
            );
            return Ok(RunStatus::Summarizing);
        }
        tracing::info!(
            target: "evalrun::ledger",
            run_id = %run_id,
            "no units to summarize; completing run"
        );
        let won = self
            .store
            .transition_status(run_id, RunStatus::Summarizing, RunStatus::Completed)
            .await?;
        if won {
            Ok(RunStatus::Completed)
        } else {
            Ok(self.store.read_run(run_id).await?.status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(total: u32, completed: u32, failed: u32) -> RunProgress {
        RunProgress {
            total,
            completed,
            failed,
        }
    }

    #[test]
    fn terminal_and_summarizing_are_sticky() {
        let done = progress(3, 3, 0);
        assert_eq!(
            determine_status(&done, RunStatus::Cancelled),
            RunStatus::Cancelled
        );
        assert_eq!(
            determine_status(&progress(3, 1, 0), RunStatus::Summarizing),
            RunStatus::Summarizing
        );
    }

    #[test]
    fn paused_advances_only_when_finished() {
        assert_eq!(
            determine_status(&progress(3, 1, 1), RunStatus::Paused),
            RunStatus::Paused
        );
        assert_eq!(
            determine_status(&progress(3, 2, 1), RunStatus::Paused),
            RunStatus::Summarizing
        );
    }

    #[test]
    fn first_progress_starts_the_run() {
        assert_eq!(
            determine_status(&progress(3, 0, 0), RunStatus::Pending),
            RunStatus::Pending
        );
        assert_eq!(
            determine_status(&progress(3, 0, 1), RunStatus::Pending),
            RunStatus::Running
        );
        assert_eq!(
            determine_status(&progress(3, 1, 0), RunStatus::Running),
            RunStatus::Running
        );
        assert_eq!(
            determine_status(&progress(3, 2, 1), RunStatus::Running),
            RunStatus::Summarizing
        );
    }

    #[test]
    fn percent_complete_rounds_and_handles_empty_runs() {
        assert_eq!(calculate_percent_complete(&progress(0, 0, 0)), 100);
        assert_eq!(calculate_percent_complete(&progress(3, 1, 0)), 33);
        assert_eq!(calculate_percent_complete(&progress(3, 2, 0)), 67);
        assert_eq!(calculate_percent_complete(&progress(8, 1, 0)), 13);
        assert_eq!(calculate_percent_complete(&progress(10, 7, 3)), 100);
    }
}
