use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{JobOptions, JobType, ProviderLimits};

/// Knobs for the orchestration layer.
///
/// Every section carries defaults so a deployment only needs to spell out
/// what it changes.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Orphan sweep cadence and staleness threshold.
    pub recovery: RecoveryConfig,
    /// Fallback limits for providers without stored configuration.
    pub limiter: LimiterConfig,
    /// Worker batch sizes for the shared queues and queue polling.
    pub queues: QueueConfig,
    /// Retry/expiry policy per job type.
    pub jobs: JobDefaults,
    /// Statically configured providers. Used when no database-backed source
    /// is wired in.
    pub providers: Vec<ProviderLimits>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub interval_secs: u64,
    /// A run must have been idle this long before it can be considered orphaned.
    pub stale_threshold_secs: u64,
    /// Run one sweep eagerly when the scheduler starts.
    pub run_on_startup: bool,
}

impl RecoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stale_threshold_secs).unwrap_or(i64::MAX))
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            stale_threshold_secs: 5 * 60,
            run_on_startup: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub default_max_parallel: u32,
    pub default_requests_per_minute: u32,
    /// Capacity of the per-provider recent completion ring.
    pub recent_completions: usize,
}

impl LimiterConfig {
    pub fn fallback_limits(&self, provider: &str) -> ProviderLimits {
        ProviderLimits::new(
            provider,
            self.default_max_parallel,
            self.default_requests_per_minute,
        )
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_max_parallel: ProviderLimits::DEFAULT_MAX_PARALLEL,
            default_requests_per_minute: ProviderLimits::DEFAULT_REQUESTS_PER_MINUTE,
            recent_completions: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub summarize_batch_size: usize,
    pub analyze_batch_size: usize,
    pub expand_batch_size: usize,
    pub stats_batch_size: usize,
    /// Upper bound on how long an idle worker waits before polling again.
    pub poll_interval_ms: u64,
}

impl QueueConfig {
    /// Batch size for a shared queue; probe queues are sized per provider.
    pub fn batch_size(&self, job_type: JobType) -> usize {
        let size = match job_type {
            JobType::Summarize => self.summarize_batch_size,
            JobType::Analyze => self.analyze_batch_size,
            JobType::Expand => self.expand_batch_size,
            JobType::Stats => self.stats_batch_size,
            JobType::Probe => 1,
        };
        size.max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            summarize_batch_size: 4,
            analyze_batch_size: 2,
            expand_batch_size: 2,
            stats_batch_size: 2,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    pub probe: JobOptions,
    pub summarize: JobOptions,
    pub analyze: JobOptions,
    pub expand: JobOptions,
    pub stats: JobOptions,
    /// Model that writes summaries, e.g. `anthropic:claude-sonnet-4-20250514`.
    /// Summaries are rate limited under its provider; unset falls back to
    /// the probed model and its provider.
    pub summary_model: Option<String>,
}

impl JobDefaults {
    pub fn options(&self, job_type: JobType) -> JobOptions {
        match job_type {
            JobType::Probe => self.probe.clone(),
            JobType::Summarize => self.summarize.clone(),
            JobType::Analyze => self.analyze.clone(),
            JobType::Expand => self.expand.clone(),
            JobType::Stats => self.stats.clone(),
        }
    }
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            probe: JobOptions {
                expire_in_secs: 10 * 60,
                ..JobOptions::default()
            },
            summarize: JobOptions {
                expire_in_secs: 5 * 60,
                ..JobOptions::default()
            },
            analyze: JobOptions {
                retry_limit: 2,
                expire_in_secs: 30 * 60,
                ..JobOptions::default()
            },
            expand: JobOptions {
                retry_limit: 2,
                expire_in_secs: 15 * 60,
                ..JobOptions::default()
            },
            stats: JobOptions {
                retry_limit: 2,
                expire_in_secs: 15 * 60,
                ..JobOptions::default()
            },
            summary_model: None,
        }
    }
}
