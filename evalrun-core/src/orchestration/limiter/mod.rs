//! Per-provider concurrency and rate limiting.
//!
//! Every call to an upstream provider goes through
//! [`LimiterRegistry::schedule`], which resolves the provider's
//! [`ProviderLimiter`] and runs the work under it. A limiter applies two
//! bounds at once: at most `max_parallel_requests` calls in flight, and a
//! rate bound made of a minimum spacing between starts
//! (`ceil(60s / requests_per_minute)`) plus a reservoir of
//! `requests_per_minute` starts that refills every 60 seconds.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::error::{OrchestratorError, Result};
use crate::types::{JobId, ProviderLimits};

pub mod registry;

pub use registry::LimiterRegistry;

const RESERVOIR_REFRESH: Duration = Duration::from_secs(60);

/// Outcome of one scheduled call, kept for observability only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub model_id: String,
    pub scenario_id: String,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Identifies the unit of work being scheduled.
#[derive(Clone, Copy, Debug)]
pub struct ScheduleContext<'a> {
    pub job_id: JobId,
    pub model_id: &'a str,
    pub scenario_id: &'a str,
}

/// Point-in-time view of a limiter's bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub recent_completions: Vec<CompletionEvent>,
}

#[derive(Debug, Default)]
struct Counters {
    active: usize,
    queued: usize,
    recent: VecDeque<CompletionEvent>,
}

#[derive(Debug)]
struct RateState {
    reservoir: u32,
    refill_at: Instant,
    next_start: Instant,
}

pub struct ProviderLimiter {
    limits: ProviderLimits,
    min_time: Duration,
    concurrency: Semaphore,
    rate: Mutex<RateState>,
    counters: StdMutex<Counters>,
    recent_capacity: usize,
}

impl fmt::Debug for ProviderLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ProviderLimiter");
        debug
            .field("limits", &self.limits)
            .field("min_time", &self.min_time)
            .field("available_permits", &self.concurrency.available_permits());
        match self.counters.try_lock() {
            Ok(counters) => {
                debug
                    .field("active", &counters.active)
                    .field("queued", &counters.queued);
            }
            Err(_) => {
                debug.field("counters", &"<locked>");
            }
        }
        debug.finish()
    }
}

/// Moves a call from queued to active and undoes whichever count it holds
/// when dropped, so cancelled callers never leak counts.
struct Slot<'a> {
    counters: &'a StdMutex<Counters>,
    started: bool,
}

impl<'a> Slot<'a> {
    fn enter(counters: &'a StdMutex<Counters>) -> Self {
        lock(counters).queued += 1;
        Self {
            counters,
            started: false,
        }
    }

    fn start(&mut self) {
        let mut counters = lock(self.counters);
        counters.queued = counters.queued.saturating_sub(1);
        counters.active += 1;
        self.started = true;
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let mut counters = lock(self.counters);
        if self.started {
            counters.active = counters.active.saturating_sub(1);
        } else {
            counters.queued = counters.queued.saturating_sub(1);
        }
    }
}

fn lock(counters: &StdMutex<Counters>) -> MutexGuard<'_, Counters> {
    counters.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn min_time(requests_per_minute: u32) -> Duration {
    let rpm = u64::from(requests_per_minute.max(1));
    Duration::from_millis(60_000u64.div_ceil(rpm))
}

impl ProviderLimiter {
    pub fn new(limits: ProviderLimits, recent_capacity: usize) -> Self {
        let now = Instant::now();
        let permits = limits.max_parallel_requests.max(1) as usize;
        Self {
            min_time: min_time(limits.requests_per_minute),
            concurrency: Semaphore::new(permits),
            rate: Mutex::new(RateState {
                reservoir: limits.requests_per_minute.max(1),
                refill_at: now + RESERVOIR_REFRESH,
                next_start: now,
            }),
            counters: StdMutex::new(Counters::default()),
            recent_capacity: recent_capacity.max(1),
            limits,
        }
    }

    pub fn limits(&self) -> &ProviderLimits {
        &self.limits
    }

    pub fn min_time(&self) -> Duration {
        self.min_time
    }

    pub fn stats(&self) -> LimiterStats {
        let counters = lock(&self.counters);
        LimiterStats {
            active_jobs: counters.active,
            queued_jobs: counters.queued,
            recent_completions: counters.recent.iter().cloned().collect(),
        }
    }

    /// Runs `work` once a concurrency permit and a rate slot are available.
    /// The outcome is recorded as a [`CompletionEvent`] and returned unchanged.
    pub async fn schedule<T, E, F>(
        &self,
        context: ScheduleContext<'_>,
        work: F,
    ) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: From<OrchestratorError>,
    {
        let mut slot = Slot::enter(&self.counters);

        let _permit = self.concurrency.acquire().await.map_err(|_| {
            E::from(OrchestratorError::Internal(format!(
                "limiter for {} is closed",
                self.limits.provider_name
            )))
        })?;
        self.wait_for_rate_slot().await;

        slot.start();
        tracing::debug!(
            target: "evalrun::limiter",
            provider = %self.limits.provider_name,
            job = %context.job_id,
            model = context.model_id,
            scenario = context.scenario_id,
            "executing"
        );

        let started = Instant::now();
        let result = work.await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.record(CompletionEvent {
            model_id: context.model_id.to_string(),
            scenario_id: context.scenario_id.to_string(),
            success: result.is_ok(),
            completed_at: Utc::now(),
            duration_ms,
        });
        drop(slot);
        result
    }

    // The rate lock is held while sleeping so that starts are handed out in
    // arrival order.
    async fn wait_for_rate_slot(&self) {
        let mut rate = self.rate.lock().await;
        loop {
            let now = Instant::now();
            if now >= rate.refill_at {
                rate.reservoir = self.limits.requests_per_minute.max(1);
                rate.refill_at = now + RESERVOIR_REFRESH;
            }
            if rate.reservoir == 0 {
                let until = rate.refill_at;
                tokio::time::sleep_until(until).await;
                continue;
            }
            if now < rate.next_start {
                let until = rate.next_start;
                tokio::time::sleep_until(until).await;
                continue;
            }
            rate.reservoir -= 1;
            rate.next_start = now + self.min_time;
            return;
        }
    }

    fn record(&self, event: CompletionEvent) {
        let mut counters = lock(&self.counters);
        if counters.recent.len() >= self.recent_capacity {
            counters.recent.pop_front();
        }
        counters.recent.push_back(event);
    }
}
