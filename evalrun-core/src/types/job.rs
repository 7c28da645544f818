use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use super::ids::{JobId, RunId};
use super::provider::infer_provider;
use super::run::ProbeUnit;

/// Upper bound for a single retry delay regardless of backoff growth.
const MAX_RETRY_DELAY_SECS: u64 = 60 * 60;

/// Logical job types. Probe work is split into one physical queue per provider;
/// every other type shares a single queue named after the type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Probe,
    Summarize,
    Analyze,
    Expand,
    Stats,
}

impl JobType {
    /// Job types served by one shared queue.
    pub const SHARED: [JobType; 4] = [
        JobType::Summarize,
        JobType::Analyze,
        JobType::Expand,
        JobType::Stats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Probe => "probe",
            JobType::Summarize => "summarize",
            JobType::Analyze => "analyze",
            JobType::Expand => "expand",
            JobType::Stats => "stats",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeJob {
    pub run_id: RunId,
    pub provider: String,
    pub model_id: String,
    pub scenario_id: String,
}

impl ProbeJob {
    pub fn for_unit(run_id: RunId, unit: &ProbeUnit) -> Self {
        Self {
            run_id,
            provider: unit.provider.clone(),
            model_id: unit.model_id.clone(),
            scenario_id: unit.scenario_id.clone(),
        }
    }

    pub fn unit(&self) -> ProbeUnit {
        ProbeUnit::new(
            self.provider.clone(),
            self.model_id.clone(),
            self.scenario_id.clone(),
        )
    }

    /// Dedupe key so a unit is never queued twice at the same time.
    pub fn singleton_key(&self) -> String {
        format!("probe:{}:{}:{}", self.run_id, self.model_id, self.scenario_id)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeJob {
    pub run_id: RunId,
    pub provider: String,
    pub model_id: String,
    pub scenario_id: String,
    /// Model that writes the summary. Unset means the probed model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_model: Option<String>,
}

impl SummarizeJob {
    pub fn for_unit(run_id: RunId, unit: &ProbeUnit) -> Self {
        Self {
            run_id,
            provider: unit.provider.clone(),
            model_id: unit.model_id.clone(),
            scenario_id: unit.scenario_id.clone(),
            summary_model: None,
        }
    }

    pub fn with_summary_model(mut self, model: Option<String>) -> Self {
        self.summary_model = model;
        self
    }

    pub fn summary_model_id(&self) -> &str {
        self.summary_model.as_deref().unwrap_or(self.model_id.as_str())
    }

    /// Provider whose limiter the summary call runs under. Falls back to the
    /// probed unit's provider when the summary model names none.
    pub fn summary_provider(&self) -> &str {
        self.summary_model
            .as_deref()
            .and_then(infer_provider)
            .unwrap_or(self.provider.as_str())
    }

    pub fn unit(&self) -> ProbeUnit {
        ProbeUnit::new(
            self.provider.clone(),
            self.model_id.clone(),
            self.scenario_id.clone(),
        )
    }

    pub fn singleton_key(&self) -> String {
        format!(
            "summarize:{}:{}:{}",
            self.run_id, self.model_id, self.scenario_id
        )
    }
}

/// Payload for job types whose handlers live outside the orchestration core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuxiliaryJob {
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    Probe(ProbeJob),
    Summarize(SummarizeJob),
    Analyze(AuxiliaryJob),
    Expand(AuxiliaryJob),
    Stats(AuxiliaryJob),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Probe(_) => JobType::Probe,
            JobPayload::Summarize(_) => JobType::Summarize,
            JobPayload::Analyze(_) => JobType::Analyze,
            JobPayload::Expand(_) => JobType::Expand,
            JobPayload::Stats(_) => JobType::Stats,
        }
    }

    pub fn run_id(&self) -> Option<RunId> {
        match self {
            JobPayload::Probe(job) => Some(job.run_id),
            JobPayload::Summarize(job) => Some(job.run_id),
            JobPayload::Analyze(job) | JobPayload::Expand(job) | JobPayload::Stats(job) => {
                job.run_id
            }
        }
    }
}

/// Delivery policy attached to every sent job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Retries after the first attempt.
    pub retry_limit: u32,
    pub retry_delay_secs: u64,
    /// Doubles the delay on every retry when set.
    pub retry_backoff: bool,
    pub expire_in_secs: u64,
    pub singleton_key: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_delay_secs: 5,
            retry_backoff: true,
            expire_in_secs: 300,
            singleton_key: None,
        }
    }
}

impl JobOptions {
    pub fn with_singleton_key(mut self, key: impl Into<String>) -> Self {
        self.singleton_key = Some(key.into());
        self
    }

    pub fn expire_in(&self) -> Duration {
        Duration::from_secs(self.expire_in_secs.max(1))
    }

    /// Delay before retry number `retry` (1-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let secs = if self.retry_backoff {
            let exp = retry.saturating_sub(1).min(20);
            self.retry_delay_secs.saturating_mul(1u64 << exp)
        } else {
            self.retry_delay_secs
        };
        Duration::from_secs(secs.min(MAX_RETRY_DELAY_SECS))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub payload: JobPayload,
    pub options: JobOptions,
}

impl SendRequest {
    pub fn new(payload: JobPayload, options: JobOptions) -> Self {
        Self { payload, options }
    }
}

/// A job as delivered to a worker handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub queue_name: String,
    pub payload: JobPayload,
    /// Zero on first delivery, incremented on every retry.
    pub attempt: u32,
    pub options: JobOptions,
}

impl QueuedJob {
    /// True when a failure now would exhaust the retry budget.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.options.retry_limit
    }
}
