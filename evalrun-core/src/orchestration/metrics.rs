//! Read-only rollup of limiter and queue state.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::limiter::{CompletionEvent, LimiterRegistry, LimiterStats};
use super::queue::{JobQueue, QueueOccupancy};
use crate::types::ProviderLimits;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetrics {
    pub provider_name: String,
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub max_parallel: u32,
    pub requests_per_minute: u32,
    pub recent_completions: Vec<CompletionEvent>,
    /// Jobs waiting or running on the provider's probe queue, when readable.
    pub queue_depth: Option<QueueOccupancy>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsTotals {
    pub active_jobs: usize,
    pub queued_jobs: usize,
}

pub struct MetricsAggregator {
    limiters: Arc<LimiterRegistry>,
    queue: Option<Arc<dyn JobQueue>>,
}

impl fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("limiters", &self.limiters)
            .field("with_queue", &self.queue.is_some())
            .finish()
    }
}

impl MetricsAggregator {
    pub fn new(limiters: Arc<LimiterRegistry>, queue: Option<Arc<dyn JobQueue>>) -> Self {
        Self { limiters, queue }
    }

    async fn build(&self, limits: ProviderLimits, stats: LimiterStats) -> ProviderMetrics {
        let queue_depth = match &self.queue {
            Some(queue) => match queue.occupancy(&limits.queue_name()).await {
                Ok(occupancy) => Some(occupancy),
                Err(err) => {
                    tracing::debug!(
                        provider = %limits.provider_name,
                        "queue depth unavailable: {err}"
                    );
                    None
                }
            },
            None => None,
        };
        ProviderMetrics {
            provider_name: limits.provider_name,
            active_jobs: stats.active_jobs,
            queued_jobs: stats.queued_jobs,
            max_parallel: limits.max_parallel_requests,
            requests_per_minute: limits.requests_per_minute,
            recent_completions: stats.recent_completions,
            queue_depth,
        }
    }

    /// One entry per provider that currently has a limiter.
    pub async fn get_all_metrics(&self) -> Vec<ProviderMetrics> {
        let mut out = Vec::new();
        for (limits, stats) in self.limiters.snapshot() {
            out.push(self.build(limits, stats).await);
        }
        out
    }

    pub async fn get_provider_metrics(&self, provider: &str) -> Option<ProviderMetrics> {
        let (limits, stats) = self.limiters.provider_snapshot(provider)?;
        Some(self.build(limits, stats).await)
    }

    pub fn get_totals(&self) -> MetricsTotals {
        self.limiters
            .snapshot()
            .into_iter()
            .fold(MetricsTotals::default(), |mut totals, (_, stats)| {
                totals.active_jobs += stats.active_jobs;
                totals.queued_jobs += stats.queued_jobs;
                totals
            })
    }
}
