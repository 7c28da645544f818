//! Run orchestration: progress ledger, provider limiting, queue topology,
//! orphan recovery, and metrics.

pub mod config;
pub mod control;
pub mod dispatcher;
pub mod handlers;
pub mod ledger;
pub mod limiter;
pub mod limits;
pub mod metrics;
pub mod queue;
pub mod recovery;
pub mod service;
pub mod topology;

pub use config::*;
pub use control::RunControl;
pub use dispatcher::QueueDispatcher;
pub use handlers::{ProbeExecutor, ProbeJobHandler, SummarizeJobHandler, SummaryExecutor};
pub use ledger::{
    NextStageDispatcher, ProgressLedger, ProgressReport, calculate_percent_complete,
    determine_status,
};
pub use limiter::{CompletionEvent, LimiterRegistry, LimiterStats, ProviderLimiter, ScheduleContext};
pub use limits::{CachedProviderLimits, ProviderLimitsSource, StaticProviderLimits};
pub use metrics::{MetricsAggregator, MetricsTotals, ProviderMetrics};
pub use queue::{InMemoryJobQueue, JobHandler, JobQueue, QueueOccupancy};
pub use recovery::{
    OrphanedRunInfo, RecoveryAction, RecoveryError, RecoveryOutcome, RecoveryScheduler,
    RecoveryService, RecoverySummary,
};
pub use service::{RunOrchestrator, RunOrchestratorBuilder};
pub use topology::{HandlerSet, QueueTopology, TopologyReport};
