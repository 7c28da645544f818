use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::config::OrchestratorConfig;
use super::control::RunControl;
use super::dispatcher::QueueDispatcher;
use super::handlers::{ProbeExecutor, ProbeJobHandler, SummarizeJobHandler, SummaryExecutor};
use super::ledger::{self, ProgressLedger, ProgressReport};
use super::limiter::{LimiterRegistry, ScheduleContext};
use super::limits::{CachedProviderLimits, ProviderLimitsSource, StaticProviderLimits};
use super::metrics::{MetricsAggregator, MetricsTotals, ProviderMetrics};
use super::queue::{JobHandler, JobQueue};
use super::recovery::{
    OrphanedRunInfo, RecoveryOutcome, RecoveryScheduler, RecoveryService, RecoverySummary,
};
use super::topology::{HandlerSet, QueueTopology, TopologyReport};
use crate::error::{OrchestratorError, Result};
use crate::persistence::RunStore;
use crate::types::{
    JobType, ProbeJob, ProbeOutcome, ProbeUnit, ProgressDelta, ProgressState, ProviderLimits,
    QueuedJob, Run, RunId, RunProgress, RunStatus,
};

/// Entry point for API layers, CLIs, and schedulers. Owns every
/// orchestration component; nothing here is process-global.
pub struct RunOrchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn RunStore>,
    queue: Arc<dyn JobQueue>,
    limiters: Arc<LimiterRegistry>,
    ledger: ProgressLedger,
    dispatcher: QueueDispatcher,
    topology: Arc<QueueTopology>,
    recovery: Arc<RecoveryService>,
    scheduler: RecoveryScheduler,
    metrics: MetricsAggregator,
    control: RunControl,
}

impl fmt::Debug for RunOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOrchestrator")
            .field("config", &self.config)
            .field("limiters", &self.limiters)
            .field("topology", &self.topology)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl RunOrchestrator {
    pub fn builder(config: OrchestratorConfig) -> RunOrchestratorBuilder {
        RunOrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn ledger(&self) -> &ProgressLedger {
        &self.ledger
    }

    pub fn limiters(&self) -> &Arc<LimiterRegistry> {
        &self.limiters
    }

    // Runs and dispatch

    pub async fn create_run(&self, units: Vec<ProbeUnit>) -> Result<Run> {
        let run = self.store.create_run(units).await?;
        tracing::info!(run_id = %run.id, total = run.progress.total, "run created");
        Ok(run)
    }

    /// Enqueues the initial probe jobs for a PENDING run. A run with no work
    /// is completed on the spot.
    pub async fn start_run_dispatch(&self, run_id: RunId, jobs: &[ProbeJob]) -> Result<usize> {
        let run = self.store.read_run(run_id).await?;
        if run.status != RunStatus::Pending {
            return Err(OrchestratorError::InvalidStateTransition {
                from: run.status,
                to: RunStatus::Running,
            });
        }
        if let Some(foreign) = jobs.iter().find(|job| job.run_id != run_id) {
            return Err(OrchestratorError::InvalidPayload(format!(
                "probe job for run {} dispatched with run {run_id}",
                foreign.run_id
            )));
        }

        if run.progress.total == 0 {
            self.ledger.reconcile_status(run_id).await?;
            return Ok(0);
        }

        let providers: BTreeSet<&str> = jobs.iter().map(|job| job.provider.as_str()).collect();
        for provider in providers {
            self.topology.ensure_provider_queue(provider).await?;
        }
        let units: Vec<ProbeUnit> = jobs.iter().map(ProbeJob::unit).collect();
        let queued = self.dispatcher.enqueue_probe_units(run_id, &units).await?;
        tracing::info!(run_id = %run_id, jobs = jobs.len(), queued, "run dispatched");
        Ok(queued)
    }

    // Progress ledger

    pub async fn update_progress(
        &self,
        run_id: RunId,
        delta: ProgressDelta,
    ) -> Result<ProgressState> {
        self.ledger.update_progress(run_id, delta).await
    }

    pub async fn increment_completed(&self, run_id: RunId) -> Result<ProgressState> {
        self.ledger.increment_completed(run_id).await
    }

    pub async fn increment_failed(&self, run_id: RunId) -> Result<ProgressState> {
        self.ledger.increment_failed(run_id).await
    }

    pub async fn record_probe_outcome(
        &self,
        run_id: RunId,
        unit: &ProbeUnit,
        outcome: ProbeOutcome,
    ) -> Result<ProgressState> {
        self.ledger.record_probe_outcome(run_id, unit, outcome).await
    }

    /// Counts a job the queue marked failed for good as a failed outcome of
    /// its unit. Used by expiry sweeps that run outside any worker.
    pub async fn record_exhausted_job(&self, job: &QueuedJob) -> Result<()> {
        self.ledger.record_abandoned_job(&job.payload).await?;
        Ok(())
    }

    pub async fn update_summarize_progress(
        &self,
        run_id: RunId,
        delta: ProgressDelta,
    ) -> Result<ProgressState> {
        self.ledger.update_summarize_progress(run_id, delta).await
    }

    pub async fn get_progress(&self, run_id: RunId) -> Result<ProgressReport> {
        self.ledger.get_progress(run_id).await
    }

    pub fn calculate_percent_complete(progress: &RunProgress) -> u32 {
        ledger::calculate_percent_complete(progress)
    }

    // Provider limiter

    pub async fn schedule<T, F>(
        &self,
        provider: &str,
        context: ScheduleContext<'_>,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.limiters.schedule(provider, context, work).await
    }

    pub async fn reload_limiters(&self) -> Result<usize> {
        self.limiters.reload_limiters().await
    }

    // Queue topology

    pub async fn register_handlers(&self) -> Result<TopologyReport> {
        self.topology.register_handlers().await
    }

    pub async fn reregister_provider_handler(&self, provider: &str) -> Result<ProviderLimits> {
        self.topology.reregister_provider_handler(provider).await
    }

    // Recovery

    pub async fn detect_orphaned_runs(&self) -> Result<Vec<OrphanedRunInfo>> {
        self.recovery.detect_orphaned_runs().await
    }

    pub async fn recover_orphaned_run(&self, info: &OrphanedRunInfo) -> Result<RecoveryOutcome> {
        self.recovery.recover_orphaned_run(info).await
    }

    pub async fn trigger_recovery(&self) -> Option<RecoverySummary> {
        self.scheduler.trigger_recovery().await
    }

    pub async fn start_recovery_scheduler(&self) -> bool {
        self.scheduler.start().await
    }

    pub async fn stop_recovery_scheduler(&self) {
        self.scheduler.stop().await;
    }

    pub async fn is_recovery_scheduler_running(&self) -> bool {
        self.scheduler.is_running().await
    }

    // Metrics

    pub async fn get_all_metrics(&self) -> Vec<ProviderMetrics> {
        self.metrics.get_all_metrics().await
    }

    pub async fn get_provider_metrics(&self, provider: &str) -> Option<ProviderMetrics> {
        self.metrics.get_provider_metrics(provider).await
    }

    pub fn get_totals(&self) -> MetricsTotals {
        self.metrics.get_totals()
    }

    // Run control

    pub async fn pause_run(&self, run_id: RunId) -> Result<Run> {
        self.control.pause_run(run_id).await
    }

    pub async fn resume_run(&self, run_id: RunId) -> Result<Run> {
        self.control.resume_run(run_id).await
    }

    pub async fn cancel_run(&self, run_id: RunId) -> Result<Run> {
        self.control.cancel_run(run_id).await
    }

    pub async fn shutdown(&self) {
        tracing::info!("shutting down run orchestrator");
        self.scheduler.stop().await;
        self.queue.shutdown().await;
    }
}

pub struct RunOrchestratorBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn RunStore>>,
    queue: Option<Arc<dyn JobQueue>>,
    limits_source: Option<Arc<dyn ProviderLimitsSource>>,
    probe_executor: Option<Arc<dyn ProbeExecutor>>,
    summary_executor: Option<Arc<dyn SummaryExecutor>>,
    extra_handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl fmt::Debug for RunOrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOrchestratorBuilder")
            .field("config", &self.config)
            .field("has_store", &self.store.is_some())
            .field("has_queue", &self.queue.is_some())
            .field("has_limits_source", &self.limits_source.is_some())
            .field("has_probe_executor", &self.probe_executor.is_some())
            .field("has_summary_executor", &self.summary_executor.is_some())
            .field("extra_handlers", &self.extra_handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RunOrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            queue: None,
            limits_source: None,
            probe_executor: None,
            summary_executor: None,
            extra_handlers: HashMap::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Defaults to the providers listed in the configuration.
    pub fn with_limits_source(mut self, source: Arc<dyn ProviderLimitsSource>) -> Self {
        self.limits_source = Some(source);
        self
    }

    pub fn with_probe_executor(mut self, executor: Arc<dyn ProbeExecutor>) -> Self {
        self.probe_executor = Some(executor);
        self
    }

    pub fn with_summary_executor(mut self, executor: Arc<dyn SummaryExecutor>) -> Self {
        self.summary_executor = Some(executor);
        self
    }

    /// Handler for one of the auxiliary job types (analyze, expand, stats).
    pub fn with_handler(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.extra_handlers.insert(job_type, handler);
        self
    }

    pub fn build(self) -> Result<RunOrchestrator> {
        let store = self
            .store
            .ok_or_else(|| OrchestratorError::Config("run store is required".into()))?;
        let queue = self
            .queue
            .ok_or_else(|| OrchestratorError::Config("job queue is required".into()))?;
        let config = self.config;

        let source = self.limits_source.unwrap_or_else(|| {
            Arc::new(StaticProviderLimits::new(config.providers.clone()))
                as Arc<dyn ProviderLimitsSource>
        });
        let limits = Arc::new(CachedProviderLimits::new(source));
        let limiters = Arc::new(LimiterRegistry::new(limits, config.limiter));

        let dispatcher = QueueDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            config.jobs.clone(),
        );
        let ledger = ProgressLedger::new(Arc::clone(&store), Arc::new(dispatcher.clone()));

        let mut handlers = HandlerSet::new();
        for (job_type, handler) in self.extra_handlers {
            handlers = handlers.with(job_type, handler);
        }
        if let Some(executor) = self.probe_executor {
            handlers = handlers.with(
                JobType::Probe,
                Arc::new(ProbeJobHandler::new(
                    Arc::clone(&store),
                    ledger.clone(),
                    Arc::clone(&limiters),
                    executor,
                )),
            );
        }
        if let Some(executor) = self.summary_executor {
            handlers = handlers.with(
                JobType::Summarize,
                Arc::new(SummarizeJobHandler::new(
                    Arc::clone(&store),
                    ledger.clone(),
                    Arc::clone(&limiters),
                    executor,
                )),
            );
        }

        let topology = Arc::new(QueueTopology::new(
            Arc::clone(&queue),
            Arc::clone(&limiters),
            config.queues,
            handlers,
        ));
        let recovery = Arc::new(RecoveryService::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            dispatcher.clone(),
            ledger.clone(),
            Arc::clone(&topology),
            config.recovery.stale_threshold(),
        ));
        let scheduler = RecoveryScheduler::new(Arc::clone(&recovery), config.recovery);
        let metrics = MetricsAggregator::new(Arc::clone(&limiters), Some(Arc::clone(&queue)));
        let control = RunControl::new(
            Arc::clone(&store),
            dispatcher.clone(),
            Arc::clone(&topology),
        );

        Ok(RunOrchestrator {
            config,
            store,
            queue,
            limiters,
            ledger,
            dispatcher,
            topology,
            recovery,
            scheduler,
            metrics,
            control,
        })
    }
}
