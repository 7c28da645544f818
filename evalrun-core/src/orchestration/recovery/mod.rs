//! Orphan detection and recovery.
//!
//! A run is orphaned when its bookkeeping says work is outstanding but the
//! queue holds nothing for it:
//!
//! 1. status is RUNNING or SUMMARIZING,
//! 2. no active and no queued jobs reference the run,
//! 3. the current stage's progress is not finished,
//! 4. the run has not been touched for the staleness threshold.
//!
//! Recovery re-enqueues the units that have no outcome for the current
//! stage. Every job carries a singleton key, so recovering a run twice (or
//! racing a worker that re-queues the same unit) merges instead of
//! duplicating.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dispatcher::QueueDispatcher;
use super::ledger::ProgressLedger;
use super::queue::JobQueue;
use super::topology::QueueTopology;
use crate::error::Result;
use crate::persistence::RunStore;
use crate::types::{ProbeUnit, Run, RunId, RunProgress, RunStatus};

pub mod scheduler;

pub use scheduler::RecoveryScheduler;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedRunInfo {
    pub run_id: RunId,
    pub status: RunStatus,
    pub progress_snapshot: RunProgress,
    pub active_job_count: usize,
    pub queued_job_count: usize,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Missing jobs were sent to the queue.
    Requeued,
    /// The run has live work or left the recoverable statuses since detection.
    AlreadyHealthy,
    /// Progress is incomplete but every unit already has an outcome.
    NothingToRequeue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryOutcome {
    pub run_id: RunId,
    pub action: RecoveryAction,
    pub requeued: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryError {
    pub run_id: RunId,
    pub message: String,
}

/// Result of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySummary {
    pub detected: usize,
    pub recovered: usize,
    /// Runs whose stalled status transition was applied.
    pub reconciled: usize,
    pub errors: Vec<RecoveryError>,
}

pub struct RecoveryService {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn JobQueue>,
    dispatcher: QueueDispatcher,
    ledger: ProgressLedger,
    topology: Arc<QueueTopology>,
    stale_threshold: chrono::Duration,
}

impl fmt::Debug for RecoveryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryService")
            .field("stale_threshold", &self.stale_threshold)
            .finish_non_exhaustive()
    }
}

impl RecoveryService {
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn JobQueue>,
        dispatcher: QueueDispatcher,
        ledger: ProgressLedger,
        topology: Arc<QueueTopology>,
        stale_threshold: chrono::Duration,
    ) -> Self {
        Self {
            store,
            queue,
            dispatcher,
            ledger,
            topology,
            stale_threshold,
        }
    }

    fn is_stale(&self, run: &Run, now: DateTime<Utc>) -> bool {
        now - run.updated_at >= self.stale_threshold
    }

    /// Read-only scan for orphaned runs.
    pub async fn detect_orphaned_runs(&self) -> Result<Vec<OrphanedRunInfo>> {
        let now = Utc::now();
        let candidates = self
            .store
            .list_runs(&[RunStatus::Running, RunStatus::Summarizing])
            .await?;

        let mut orphans = Vec::new();
        for run in candidates {
            if run.stage_progress().is_finished() || !self.is_stale(&run, now) {
                continue;
            }
            let occupancy = self.queue.run_occupancy(run.id).await?;
            if !occupancy.is_idle() {
                continue;
            }
            tracing::info!(
                target: "evalrun::recovery",
                run_id = %run.id,
                status = %run.status,
                last_updated_at = %run.updated_at,
                "orphaned run detected"
            );
            orphans.push(OrphanedRunInfo {
                run_id: run.id,
                status: run.status,
                progress_snapshot: run.stage_progress(),
                active_job_count: occupancy.active,
                queued_job_count: occupancy.queued,
                last_updated_at: run.updated_at,
            });
        }
        Ok(orphans)
    }

    /// Re-enqueues the jobs a detected run is missing. Safe to call again on
    /// a run that has since been repaired.
    pub async fn recover_orphaned_run(&self, info: &OrphanedRunInfo) -> Result<RecoveryOutcome> {
        let healthy = RecoveryOutcome {
            run_id: info.run_id,
            action: RecoveryAction::AlreadyHealthy,
            requeued: 0,
        };

        let run = self.store.read_run(info.run_id).await?;
        if run.status != info.status || run.stage_progress().is_finished() {
            return Ok(healthy);
        }
        if !self.queue.run_occupancy(run.id).await?.is_idle() {
            return Ok(healthy);
        }

        let requeued = match run.status {
            RunStatus::Running => {
                let units = self.capped(&run, self.store.pending_probe_units(run.id).await?);
                let providers: BTreeSet<&str> =
                    units.iter().map(|unit| unit.provider.as_str()).collect();
                for provider in providers {
                    self.topology.ensure_provider_queue(provider).await?;
                }
                self.dispatcher.enqueue_probe_units(run.id, &units).await?
            }
            RunStatus::Summarizing => {
                let units = self.capped(&run, self.store.unsummarized_units(run.id).await?);
                self.dispatcher
                    .enqueue_summarize_units(run.id, &units)
                    .await?
            }
            _ => return Ok(healthy),
        };

        if requeued == 0 {
            tracing::warn!(
                target: "evalrun::recovery",
                run_id = %run.id,
                status = %run.status,
                "orphaned run has no units left to re-queue"
            );
            return Ok(RecoveryOutcome {
                run_id: run.id,
                action: RecoveryAction::NothingToRequeue,
                requeued: 0,
            });
        }

        tracing::info!(
            target: "evalrun::recovery",
            run_id = %run.id,
            status = %run.status,
            requeued,
            "orphaned run recovered"
        );
        Ok(RecoveryOutcome {
            run_id: run.id,
            action: RecoveryAction::Requeued,
            requeued,
        })
    }

    /// Never re-queues more units than the stage's counters say are missing.
    fn capped(&self, run: &Run, mut units: Vec<ProbeUnit>) -> Vec<ProbeUnit> {
        let remaining = usize::try_from(run.stage_progress().remaining()).unwrap_or(usize::MAX);
        if units.len() > remaining {
            tracing::warn!(
                target: "evalrun::recovery",
                run_id = %run.id,
                status = %run.status,
                units = units.len(),
                remaining,
                "unit outcomes lag the progress counters; re-queueing the remaining count only"
            );
            units.truncate(remaining);
        }
        units
    }

    /// Stale runs whose progress already implies a transition that never
    /// happened.
    async fn stalled_runs(&self) -> Result<Vec<Run>> {
        let now = Utc::now();
        let runs = self
            .store
            .list_runs(&[
                RunStatus::Running,
                RunStatus::Paused,
                RunStatus::Summarizing,
            ])
            .await?;
        Ok(runs
            .into_iter()
            .filter(|run| self.is_stale(run, now))
            .filter(|run| match run.status {
                RunStatus::Summarizing => run
                    .summarize_progress
                    .is_none_or(|progress| progress.is_finished()),
                _ => run.progress.is_finished(),
            })
            .collect())
    }

    /// Detection, recovery, and stalled-transition reconciliation. Failures
    /// on individual runs are collected; a failure to list runs aborts the
    /// sweep.
    pub async fn recover_orphaned_runs(&self) -> Result<RecoverySummary> {
        let orphans = self.detect_orphaned_runs().await?;
        let mut summary = RecoverySummary {
            detected: orphans.len(),
            ..RecoverySummary::default()
        };

        for info in &orphans {
            match self.recover_orphaned_run(info).await {
                Ok(outcome) if outcome.action == RecoveryAction::Requeued => {
                    summary.recovered += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(
                        target: "evalrun::recovery",
                        run_id = %info.run_id,
                        "failed to recover run: {err}"
                    );
                    summary.errors.push(RecoveryError {
                        run_id: info.run_id,
                        message: err.to_string(),
                    });
                }
            }
        }

        for run in self.stalled_runs().await? {
            match self.ledger.reconcile_status(run.id).await {
                Ok(Some(status)) => {
                    tracing::info!(
                        target: "evalrun::recovery",
                        run_id = %run.id,
                        from = %run.status,
                        to = %status,
                        "stalled run reconciled"
                    );
                    summary.reconciled += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(
                        target: "evalrun::recovery",
                        run_id = %run.id,
                        "failed to reconcile run: {err}"
                    );
                    summary.errors.push(RecoveryError {
                        run_id: run.id,
                        message: err.to_string(),
                    });
                }
            }
        }

        Ok(summary)
    }
}
