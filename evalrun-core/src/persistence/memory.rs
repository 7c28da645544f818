use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{IncrementOutcome, RunStore};
use crate::error::{OrchestratorError, Result};
use crate::types::{
    ProbeOutcome, ProbeUnit, ProgressDelta, ProgressState, Run, RunId, RunProgress, RunStatus,
    SummaryOutcome,
};

#[derive(Clone, Debug, Default)]
struct UnitState {
    outcome: Option<ProbeOutcome>,
    summary: Option<SummaryOutcome>,
}

#[derive(Debug)]
struct RunEntry {
    run: Run,
    units: BTreeMap<ProbeUnit, UnitState>,
}

/// Process-local store. A single mutex stands in for the row lock a
/// relational store takes during a conditional update.
#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<Mutex<HashMap<RunId, RunEntry>>>,
}

impl fmt::Debug for InMemoryRunStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryRunStore");
        match self.runs.try_lock() {
            Ok(runs) => {
                debug.field("run_count", &runs.len());
            }
            Err(_) => {
                debug.field("runs", &"<locked>");
            }
        }
        debug.finish()
    }
}

fn not_found(run_id: RunId) -> OrchestratorError {
    OrchestratorError::NotFound(format!("run {run_id}"))
}

fn unit_not_found(run_id: RunId, unit: &ProbeUnit) -> OrchestratorError {
    OrchestratorError::NotFound(format!("unit {unit} in run {run_id}"))
}

/// Gives counter-only progress an owner: the first pending units in unit
/// order take the succeeded outcomes, the next ones the failed outcomes.
fn claim_pending_units(units: &mut BTreeMap<ProbeUnit, UnitState>, delta: ProgressDelta) {
    let outcomes = std::iter::repeat_n(ProbeOutcome::Succeeded, delta.completed as usize)
        .chain(std::iter::repeat_n(ProbeOutcome::Failed, delta.failed as usize));
    let pending = units.values_mut().filter(|state| state.outcome.is_none());
    for (state, outcome) in pending.zip(outcomes) {
        state.outcome = Some(outcome);
    }
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `updated_at` into the past, as if the run had been idle.
    pub async fn set_updated_at(&self, run_id: RunId, at: DateTime<Utc>) -> Result<()> {
        let mut runs = self.runs.lock().await;
        let entry = runs.get_mut(&run_id).ok_or_else(|| not_found(run_id))?;
        entry.run.updated_at = at;
        Ok(())
    }

    /// Unconditional status write, bypassing transition rules. Stands in for
    /// writes made by external collaborators.
    pub async fn force_status(&self, run_id: RunId, status: RunStatus) -> Result<()> {
        let mut runs = self.runs.lock().await;
        let entry = runs.get_mut(&run_id).ok_or_else(|| not_found(run_id))?;
        entry.run.status = status;
        entry.run.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, units: Vec<ProbeUnit>) -> Result<Run> {
        let units: BTreeMap<ProbeUnit, UnitState> = units
            .into_iter()
            .map(|unit| (unit, UnitState::default()))
            .collect();
        let total = u32::try_from(units.len())
            .map_err(|_| OrchestratorError::Internal("run has too many units".into()))?;
        let run = Run::new(total);
        let mut runs = self.runs.lock().await;
        runs.insert(
            run.id,
            RunEntry {
                run: run.clone(),
                units,
            },
        );
        Ok(run)
    }

    async fn read_run(&self, run_id: RunId) -> Result<Run> {
        let runs = self.runs.lock().await;
        runs.get(&run_id)
            .map(|entry| entry.run.clone())
            .ok_or_else(|| not_found(run_id))
    }

    async fn list_runs(&self, statuses: &[RunStatus]) -> Result<Vec<Run>> {
        let runs = self.runs.lock().await;
        let mut out: Vec<Run> = runs
            .values()
            .filter(|entry| statuses.contains(&entry.run.status))
            .map(|entry| entry.run.clone())
            .collect();
        out.sort_by_key(|run| run.created_at);
        Ok(out)
    }

    async fn conditional_increment(
        &self,
        run_id: RunId,
        delta: ProgressDelta,
    ) -> Result<IncrementOutcome> {
        let mut runs = self.runs.lock().await;
        let entry = runs.get_mut(&run_id).ok_or_else(|| not_found(run_id))?;
        let run = &mut entry.run;
        let applied = run.status.accepts_probe_progress() && run.progress.try_apply(delta);
        if applied {
            claim_pending_units(&mut entry.units, delta);
            run.updated_at = Utc::now();
        }
        Ok(IncrementOutcome {
            applied,
            state: run.state(),
        })
    }

    async fn conditional_increment_summarize(
        &self,
        run_id: RunId,
        delta: ProgressDelta,
    ) -> Result<IncrementOutcome> {
        let mut runs = self.runs.lock().await;
        let entry = runs.get_mut(&run_id).ok_or_else(|| not_found(run_id))?;
        let run = &mut entry.run;
        let mut progress = run.summarize_progress.unwrap_or_default();
        let applied = run.status == RunStatus::Summarizing && progress.try_apply(delta);
        if applied {
            run.summarize_progress = Some(progress);
            run.updated_at = Utc::now();
        }
        Ok(IncrementOutcome {
            applied,
            state: ProgressState {
                progress,
                status: run.status,
            },
        })
    }

    async fn transition_status(
        &self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<bool> {
        let mut runs = self.runs.lock().await;
        let entry = runs.get_mut(&run_id).ok_or_else(|| not_found(run_id))?;
        let run = &mut entry.run;
        if run.status != from {
            return Ok(false);
        }
        let now = Utc::now();
        run.status = to;
        run.updated_at = now;
        if to == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if to.is_terminal() {
            run.completed_at = Some(now);
        }
        Ok(true)
    }

    async fn init_summarize_progress(&self, run_id: RunId, total: u32) -> Result<()> {
        let mut runs = self.runs.lock().await;
        let entry = runs.get_mut(&run_id).ok_or_else(|| not_found(run_id))?;
        entry.run.summarize_progress = Some(RunProgress::new(total));
        entry.run.updated_at = Utc::now();
        Ok(())
    }

    async fn pending_probe_units(&self, run_id: RunId) -> Result<Vec<ProbeUnit>> {
        let runs = self.runs.lock().await;
        let entry = runs.get(&run_id).ok_or_else(|| not_found(run_id))?;
        Ok(entry
            .units
            .iter()
            .filter(|(_, state)| state.outcome.is_none())
            .map(|(unit, _)| unit.clone())
            .collect())
    }

    async fn record_probe_outcome(
        &self,
        run_id: RunId,
        unit: &ProbeUnit,
        outcome: ProbeOutcome,
    ) -> Result<IncrementOutcome> {
        let mut runs = self.runs.lock().await;
        let entry = runs.get_mut(&run_id).ok_or_else(|| not_found(run_id))?;
        let state = entry
            .units
            .get_mut(unit)
            .ok_or_else(|| unit_not_found(run_id, unit))?;
        let run = &mut entry.run;
        let applied = state.outcome.is_none()
            && run.status.accepts_probe_progress()
            && run.progress.try_apply(outcome.delta());
        if applied {
            state.outcome = Some(outcome);
            run.updated_at = Utc::now();
        }
        Ok(IncrementOutcome {
            applied,
            state: run.state(),
        })
    }

    async fn unsummarized_units(&self, run_id: RunId) -> Result<Vec<ProbeUnit>> {
        let runs = self.runs.lock().await;
        let entry = runs.get(&run_id).ok_or_else(|| not_found(run_id))?;
        Ok(entry
            .units
            .iter()
            .filter(|(_, state)| {
                state.outcome == Some(ProbeOutcome::Succeeded) && state.summary.is_none()
            })
            .map(|(unit, _)| unit.clone())
            .collect())
    }

    async fn record_summary_outcome(
        &self,
        run_id: RunId,
        unit: &ProbeUnit,
        outcome: SummaryOutcome,
    ) -> Result<IncrementOutcome> {
        let mut runs = self.runs.lock().await;
        let entry = runs.get_mut(&run_id).ok_or_else(|| not_found(run_id))?;
        let state = entry
            .units
            .get_mut(unit)
            .ok_or_else(|| unit_not_found(run_id, unit))?;
        let run = &mut entry.run;
        let mut progress = run.summarize_progress.unwrap_or_default();
        let applied = state.outcome == Some(ProbeOutcome::Succeeded)
            && state.summary.is_none()
            && run.status == RunStatus::Summarizing
            && progress.try_apply(outcome.delta());
        if applied {
            state.summary = Some(outcome);
            run.summarize_progress = Some(progress);
            run.updated_at = Utc::now();
        }
        Ok(IncrementOutcome {
            applied,
            state: ProgressState {
                progress,
                status: run.status,
            },
        })
    }
}
