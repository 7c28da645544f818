use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::RunId;

/// Lifecycle of a run. Transitions only move forward along
/// PENDING -> RUNNING -> (PAUSED <-> RUNNING) -> SUMMARIZING -> terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Summarizing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 7] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Paused,
        RunStatus::Summarizing,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Summarizing => "SUMMARIZING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Statuses in which probe completions are still counted.
    pub fn accepts_probe_progress(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Statuses the recovery sweep treats as "work should exist".
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Pending | RunStatus::Running | RunStatus::Summarizing
        )
    }

    fn rank(&self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Running | RunStatus::Paused => 1,
            RunStatus::Summarizing => 2,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => 3,
        }
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if self.is_terminal() || *self == next {
            return false;
        }
        if next.is_terminal() {
            // Completion is only reachable through the summarize stage.
            return next != RunStatus::Completed || *self == RunStatus::Summarizing;
        }
        match (self, next) {
            (RunStatus::Running, RunStatus::Paused) | (RunStatus::Paused, RunStatus::Running) => {
                true
            }
            (RunStatus::Pending, RunStatus::Paused) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown run status: {s}"))
    }
}

/// Counters for one stage of a run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl RunProgress {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            completed: 0,
            failed: 0,
        }
    }

    pub fn processed(&self) -> u32 {
        self.completed.saturating_add(self.failed)
    }

    pub fn is_finished(&self) -> bool {
        self.processed() >= self.total
    }

    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.processed())
    }

    /// Applies `delta` when the result keeps `completed + failed <= total`.
    /// Returns whether the counters changed.
    pub fn try_apply(&mut self, delta: ProgressDelta) -> bool {
        if delta.is_empty() {
            return false;
        }
        let next = u64::from(self.processed()) + u64::from(delta.completed) + u64::from(delta.failed);
        if next > u64::from(self.total) {
            return false;
        }
        self.completed += delta.completed;
        self.failed += delta.failed;
        true
    }
}

/// Increment request for [`RunProgress`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProgressDelta {
    pub completed: u32,
    pub failed: u32,
}

impl ProgressDelta {
    pub const COMPLETED: ProgressDelta = ProgressDelta {
        completed: 1,
        failed: 0,
    };
    pub const FAILED: ProgressDelta = ProgressDelta {
        completed: 0,
        failed: 1,
    };

    pub fn is_empty(&self) -> bool {
        self.completed == 0 && self.failed == 0
    }
}

/// What the ledger hands back after every progress call.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub progress: RunProgress,
    pub status: RunStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    pub progress: RunProgress,
    pub summarize_progress: Option<RunProgress>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(total: u32) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            status: RunStatus::Pending,
            progress: RunProgress::new(total),
            summarize_progress: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn state(&self) -> ProgressState {
        ProgressState {
            progress: self.progress,
            status: self.status,
        }
    }

    /// Counters relevant to the stage the run is currently in.
    pub fn stage_progress(&self) -> RunProgress {
        match self.status {
            RunStatus::Summarizing => self.summarize_progress.unwrap_or_default(),
            _ => self.progress,
        }
    }
}

/// One model x scenario pair of probe work inside a run.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeUnit {
    pub provider: String,
    pub model_id: String,
    pub scenario_id: String,
}

impl ProbeUnit {
    pub fn new(
        provider: impl Into<String>,
        model_id: impl Into<String>,
        scenario_id: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            scenario_id: scenario_id.into(),
        }
    }
}

impl fmt::Display for ProbeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.model_id, self.scenario_id)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Succeeded,
    Failed,
}

impl ProbeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeOutcome::Succeeded => "succeeded",
            ProbeOutcome::Failed => "failed",
        }
    }

    pub fn delta(&self) -> ProgressDelta {
        match self {
            ProbeOutcome::Succeeded => ProgressDelta::COMPLETED,
            ProbeOutcome::Failed => ProgressDelta::FAILED,
        }
    }
}

pub type SummaryOutcome = ProbeOutcome;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_apply_refuses_to_exceed_total() {
        let mut progress = RunProgress {
            total: 3,
            completed: 2,
            failed: 0,
        };
        assert!(progress.try_apply(ProgressDelta::FAILED));
        assert!(!progress.try_apply(ProgressDelta::COMPLETED));
        assert_eq!(progress.processed(), 3);
    }

    #[test]
    fn status_transitions_never_regress() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Paused));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Summarizing));
        assert!(RunStatus::Summarizing.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Summarizing.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Cancelled));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Cancelled));
    }

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
        assert_eq!(
            serde_json::to_string(&RunStatus::Summarizing).unwrap(),
            "\"SUMMARIZING\""
        );
    }
}
