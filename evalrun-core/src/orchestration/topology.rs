//! Maps job types onto physical queues and keeps probe workers sized to
//! their provider's concurrency limit.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::config::QueueConfig;
use super::limiter::LimiterRegistry;
use super::queue::{JobHandler, JobQueue, QueueOccupancy};
use crate::error::Result;
use crate::types::{JobType, ProviderLimits, probe_queue_name};

/// Handlers attached by the topology manager, by job type. Probe work uses
/// one handler across all provider queues.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }
}

/// Summary of a [`QueueTopology::register_handlers`] pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyReport {
    pub created: Vec<String>,
    pub attached: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct QueueTopology {
    queue: Arc<dyn JobQueue>,
    limiters: Arc<LimiterRegistry>,
    config: QueueConfig,
    handlers: HandlerSet,
    /// Queues with an attached worker. Also serializes topology changes.
    attached: Mutex<HashSet<String>>,
}

impl fmt::Debug for QueueTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("QueueTopology");
        debug
            .field("config", &self.config)
            .field("handlers", &self.handlers);
        match self.attached.try_lock() {
            Ok(attached) => {
                debug.field("attached", &attached.len());
            }
            Err(_) => {
                debug.field("attached", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl QueueTopology {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        limiters: Arc<LimiterRegistry>,
        config: QueueConfig,
        handlers: HandlerSet,
    ) -> Self {
        Self {
            queue,
            limiters,
            config,
            handlers,
            attached: Mutex::new(HashSet::new()),
        }
    }

    /// Creates every queue, then attaches one worker per queue. Queues that
    /// already have a worker are left alone.
    pub async fn register_handlers(&self) -> Result<TopologyReport> {
        let mut attached = self.attached.lock().await;
        let providers = self.limiters.limits_cache().all().await?;

        let mut plan: Vec<(String, JobType, usize)> = providers
            .iter()
            .map(|limits| (limits.queue_name(), JobType::Probe, limits.batch_size()))
            .collect();
        plan.extend(JobType::SHARED.iter().map(|job_type| {
            (
                job_type.as_str().to_string(),
                *job_type,
                self.config.batch_size(*job_type),
            )
        }));

        let mut report = TopologyReport::default();
        for (name, _, _) in &plan {
            self.queue.create_queue(name).await?;
            report.created.push(name.clone());
        }

        for (name, job_type, batch_size) in plan {
            if attached.contains(&name) {
                continue;
            }
            let Some(handler) = self.handlers.get(job_type) else {
                tracing::warn!(
                    target: "evalrun::topology",
                    queue = %name,
                    job_type = %job_type,
                    "no handler registered for job type; queue has no worker"
                );
                report.skipped.push(name);
                continue;
            };
            self.queue
                .register_worker(&name, batch_size, handler)
                .await?;
            tracing::info!(
                target: "evalrun::topology",
                queue = %name,
                batch_size,
                "worker attached"
            );
            attached.insert(name.clone());
            report.attached.push(name);
        }
        Ok(report)
    }

    /// Swaps the worker on a provider's probe queue for one sized to the
    /// provider's current limits, without aborting in-flight jobs.
    pub async fn reregister_provider_handler(&self, provider: &str) -> Result<ProviderLimits> {
        let mut attached = self.attached.lock().await;
        let queue_name = probe_queue_name(provider);

        let snapshot = match self.queue.occupancy(&queue_name).await {
            Ok(occupancy) => occupancy,
            Err(err) => {
                tracing::warn!(
                    target: "evalrun::topology",
                    queue = %queue_name,
                    "could not read queue occupancy: {err}"
                );
                QueueOccupancy::default()
            }
        };
        tracing::info!(
            target: "evalrun::topology",
            provider,
            queue = %queue_name,
            active = snapshot.active,
            queued = snapshot.queued,
            "re-registering provider worker"
        );

        self.queue.deregister_worker(&queue_name).await?;
        attached.remove(&queue_name);

        self.limiters.limits_cache().invalidate().await;
        let limits = self.limiters.resolve_limits(provider).await?;

        self.queue.create_queue(&queue_name).await?;
        match self.handlers.get(JobType::Probe) {
            Some(handler) => {
                self.queue
                    .register_worker(&queue_name, limits.batch_size(), handler)
                    .await?;
                attached.insert(queue_name.clone());
            }
            None => {
                tracing::warn!(
                    target: "evalrun::topology",
                    queue = %queue_name,
                    "no probe handler registered; queue left without a worker"
                );
            }
        }

        self.limiters.reload_limiter(provider).await?;
        tracing::info!(
            target: "evalrun::topology",
            provider,
            batch_size = limits.batch_size(),
            requests_per_minute = limits.requests_per_minute,
            "provider worker re-registered"
        );
        Ok(limits)
    }

    /// Provisions the probe queue and worker for a provider on first use.
    /// Returns the queue name.
    pub async fn ensure_provider_queue(&self, provider: &str) -> Result<String> {
        let queue_name = probe_queue_name(provider);
        let mut attached = self.attached.lock().await;
        if attached.contains(&queue_name) {
            return Ok(queue_name);
        }

        self.queue.create_queue(&queue_name).await?;
        if let Some(handler) = self.handlers.get(JobType::Probe) {
            let limits = self.limiters.resolve_limits(provider).await?;
            self.queue
                .register_worker(&queue_name, limits.batch_size(), handler)
                .await?;
            attached.insert(queue_name.clone());
            tracing::info!(
                target: "evalrun::topology",
                provider,
                queue = %queue_name,
                batch_size = limits.batch_size(),
                "provider queue provisioned"
            );
        }
        Ok(queue_name)
    }

    pub async fn attached_queues(&self) -> Vec<String> {
        let attached = self.attached.lock().await;
        let mut names: Vec<String> = attached.iter().cloned().collect();
        names.sort();
        names
    }
}
