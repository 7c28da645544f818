//! Storage collaborators for run bookkeeping.
//!
//! [`RunStore`] is the relational-store seam. Every mutation that several
//! workers may race on (`conditional_increment*`, `transition_status`,
//! `record_*_outcome`) must be a single atomic conditional update in the
//! backing store; callers never read-modify-write run rows themselves.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    ProbeOutcome, ProbeUnit, ProgressDelta, ProgressState, Run, RunId, RunStatus, SummaryOutcome,
};

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::InMemoryRunStore;

/// Result of a conditional increment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IncrementOutcome {
    /// False when the guard rejected the increment; `state` is then the
    /// unchanged current state.
    pub applied: bool,
    pub state: ProgressState,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Creates a PENDING run whose probe total equals the number of distinct units.
    async fn create_run(&self, units: Vec<ProbeUnit>) -> Result<Run>;

    async fn read_run(&self, run_id: RunId) -> Result<Run>;

    async fn list_runs(&self, statuses: &[RunStatus]) -> Result<Vec<Run>>;

    /// Adds `delta` to the probe counters in one round trip, only while the run
    /// is PENDING or RUNNING and `completed + failed` stays within `total`.
    ///
    /// An applied increment also gives that many pending units an outcome,
    /// taken in unit order, so [`Self::pending_probe_units`] and
    /// [`Self::unsummarized_units`] always agree with the counters.
    async fn conditional_increment(
        &self,
        run_id: RunId,
        delta: ProgressDelta,
    ) -> Result<IncrementOutcome>;

    /// Summarize-stage counterpart, guarded on SUMMARIZING. The returned
    /// state carries the summarize counters.
    async fn conditional_increment_summarize(
        &self,
        run_id: RunId,
        delta: ProgressDelta,
    ) -> Result<IncrementOutcome>;

    /// Compare-and-set status write. Stamps `started_at` on the first entry
    /// into RUNNING and `completed_at` when entering a terminal status.
    /// Returns false when the current status is no longer `from`.
    async fn transition_status(&self, run_id: RunId, from: RunStatus, to: RunStatus)
    -> Result<bool>;

    async fn init_summarize_progress(&self, run_id: RunId, total: u32) -> Result<()>;

    /// Units with no recorded probe outcome.
    async fn pending_probe_units(&self, run_id: RunId) -> Result<Vec<ProbeUnit>>;

    /// Records a unit's probe outcome and counts it, as one atomic update.
    /// Applied only when the unit has no outcome yet and the same guard as
    /// [`Self::conditional_increment`] passes; otherwise nothing changes.
    async fn record_probe_outcome(
        &self,
        run_id: RunId,
        unit: &ProbeUnit,
        outcome: ProbeOutcome,
    ) -> Result<IncrementOutcome>;

    /// Succeeded units that have no summary outcome yet.
    async fn unsummarized_units(&self, run_id: RunId) -> Result<Vec<ProbeUnit>>;

    /// Summarize-stage counterpart of [`Self::record_probe_outcome`], guarded
    /// on SUMMARIZING and on the unit having succeeded without a summary.
    async fn record_summary_outcome(
        &self,
        run_id: RunId,
        unit: &ProbeUnit,
        outcome: SummaryOutcome,
    ) -> Result<IncrementOutcome>;
}
