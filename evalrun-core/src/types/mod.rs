//! Domain types shared by every orchestration component.

pub mod ids;
pub mod job;
pub mod provider;
pub mod run;
pub mod upstream;

pub use ids::{JobId, RunId};
pub use job::{AuxiliaryJob, JobOptions, JobPayload, JobType, ProbeJob, QueuedJob, SendRequest, SummarizeJob};
pub use provider::{ProviderLimits, infer_provider, probe_queue_name};
pub use run::{
    ProbeOutcome, ProbeUnit, ProgressDelta, ProgressState, Run, RunProgress, RunStatus,
    SummaryOutcome,
};
pub use upstream::{UpstreamError, UpstreamErrorCode};
