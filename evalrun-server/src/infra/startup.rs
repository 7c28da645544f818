use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use evalrun_core::orchestration::RunOrchestrator;
use evalrun_core::persistence::postgres::{
    PostgresJobQueue, PostgresProviderLimits, PostgresRunStore,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::{Config, DatabaseConfig};
use super::workers::{ProcessProbeExecutor, ProcessSummaryExecutor};

const EXPIRY_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Whether the orchestrator attaches worker-process executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Attach,
    Detached,
}

pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .test_before_acquire(true)
        .connect(&config.url)
        .await
        .context("failed to connect to PostgreSQL")
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    evalrun_core::MIGRATOR
        .run(pool)
        .await
        .context("database migration failed")
}

/// Writes the configured provider limits into `llm_providers` so every
/// process sharing the database sees the same values.
pub async fn seed_provider_limits(config: &Config, pool: &PgPool) -> anyhow::Result<usize> {
    let source = PostgresProviderLimits::new(pool.clone());
    for limits in &config.orchestrator.providers {
        source
            .upsert(limits)
            .await
            .with_context(|| format!("failed to store limits for {}", limits.provider_name))?;
    }
    Ok(config.orchestrator.providers.len())
}

pub struct Runtime {
    pub orchestrator: Arc<RunOrchestrator>,
    pub queue: PostgresJobQueue,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

pub fn build_runtime(config: &Config, pool: PgPool, mode: WorkerMode) -> anyhow::Result<Runtime> {
    let queue =
        PostgresJobQueue::with_poll_interval(pool.clone(), config.orchestrator.queues.poll_interval());

    let mut builder = RunOrchestrator::builder(config.orchestrator.clone())
        .with_store(Arc::new(PostgresRunStore::new(pool.clone())))
        .with_queue(Arc::new(queue.clone()))
        .with_limits_source(Arc::new(PostgresProviderLimits::new(pool)));

    if mode == WorkerMode::Attach {
        let timeout = config.workers.timeout;
        if let Some(command) = &config.workers.probe {
            info!(program = %command.program, "probe worker attached");
            builder = builder
                .with_probe_executor(Arc::new(ProcessProbeExecutor::new(command.clone(), timeout)));
        }
        if let Some(command) = &config.workers.summary {
            info!(program = %command.program, "summary worker attached");
            builder = builder.with_summary_executor(Arc::new(ProcessSummaryExecutor::new(
                command.clone(),
                timeout,
            )));
        }
    }

    let orchestrator = builder.build().context("failed to build run orchestrator")?;
    Ok(Runtime {
        orchestrator: Arc::new(orchestrator),
        queue,
    })
}

/// Periodically resurrects jobs whose workers died mid-flight, independent
/// of whether any worker is polling the affected queue. Jobs whose last
/// attempt expired are counted as failed outcomes of their run.
pub fn spawn_expiry_scanner(
    queue: PostgresJobQueue,
    orchestrator: Arc<RunOrchestrator>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EXPIRY_SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match queue.scan_expired_jobs().await {
                    Ok(expired) => {
                        if expired.requeued > 0 {
                            info!(requeued = expired.requeued, "expired jobs returned to their queues");
                        }
                        for job in &expired.exhausted {
                            if let Err(err) = orchestrator.record_exhausted_job(job).await {
                                warn!(job = %job.id, "failed to record expired job: {err}");
                            }
                        }
                    }
                    Err(err) => warn!("expired job scan failed: {err}"),
                },
            }
        }
    })
}
