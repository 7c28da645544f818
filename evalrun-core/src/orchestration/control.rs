//! Operator-driven status changes: pause, resume, cancel.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use super::dispatcher::QueueDispatcher;
use super::topology::QueueTopology;
use crate::error::{OrchestratorError, Result};
use crate::persistence::RunStore;
use crate::types::{Run, RunId, RunStatus};

const MAX_TRANSITION_ATTEMPTS: usize = 3;

pub struct RunControl {
    store: Arc<dyn RunStore>,
    dispatcher: QueueDispatcher,
    topology: Arc<QueueTopology>,
}

impl fmt::Debug for RunControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunControl").finish_non_exhaustive()
    }
}

impl RunControl {
    pub fn new(
        store: Arc<dyn RunStore>,
        dispatcher: QueueDispatcher,
        topology: Arc<QueueTopology>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            topology,
        }
    }

    async fn transition(&self, run_id: RunId, to: RunStatus) -> Result<Run> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let run = self.store.read_run(run_id).await?;
            if !run.status.can_transition_to(to) {
                return Err(OrchestratorError::InvalidStateTransition {
                    from: run.status,
                    to,
                });
            }
            if self.store.transition_status(run_id, run.status, to).await? {
                tracing::info!(run_id = %run_id, from = %run.status, to = %to, "run status set");
                return self.store.read_run(run_id).await;
            }
        }
        Err(OrchestratorError::Internal(format!(
            "run {run_id} kept changing status while moving to {to}"
        )))
    }

    /// Workers stop counting the run's probe results; units that finish while
    /// paused stay pending.
    pub async fn pause_run(&self, run_id: RunId) -> Result<Run> {
        self.transition(run_id, RunStatus::Paused).await
    }

    /// Moves a paused run back to RUNNING and re-dispatches its pending units.
    pub async fn resume_run(&self, run_id: RunId) -> Result<Run> {
        let current = self.store.read_run(run_id).await?;
        if current.status != RunStatus::Paused {
            return Err(OrchestratorError::InvalidStateTransition {
                from: current.status,
                to: RunStatus::Running,
            });
        }
        let run = self.transition(run_id, RunStatus::Running).await?;

        let units = self.store.pending_probe_units(run_id).await?;
        let providers: BTreeSet<&str> = units.iter().map(|unit| unit.provider.as_str()).collect();
        for provider in providers {
            self.topology.ensure_provider_queue(provider).await?;
        }
        let queued = self.dispatcher.enqueue_probe_units(run_id, &units).await?;
        tracing::info!(run_id = %run_id, pending = units.len(), queued, "run resumed");
        Ok(run)
    }

    pub async fn cancel_run(&self, run_id: RunId) -> Result<Run> {
        self.transition(run_id, RunStatus::Cancelled).await
    }
}
