#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use evalrun_core::orchestration::{
    InMemoryJobQueue, JobDefaults, JobQueue, ProbeExecutor, ProgressLedger, QueueDispatcher,
    SummaryExecutor,
};
use evalrun_core::persistence::{InMemoryRunStore, RunStore};
use evalrun_core::types::{
    JobType, ProbeJob, ProbeUnit, Run, RunId, RunStatus, SummarizeJob, UpstreamError,
    UpstreamErrorCode,
};
use tokio::sync::Mutex;

pub fn units(provider: &str, count: usize) -> Vec<ProbeUnit> {
    (0..count)
        .map(|i| ProbeUnit::new(provider, "gpt-4o", format!("scenario-{i:02}")))
        .collect()
}

/// Store, queue, and ledger wired the way the orchestrator wires them, with
/// the shared summarize queue already created.
pub struct LedgerHarness {
    pub store: Arc<InMemoryRunStore>,
    pub queue: Arc<InMemoryJobQueue>,
    pub dispatcher: QueueDispatcher,
    pub ledger: ProgressLedger,
}

pub async fn ledger_harness() -> LedgerHarness {
    let store = Arc::new(InMemoryRunStore::new());
    let queue = Arc::new(InMemoryJobQueue::with_poll_interval(Duration::from_millis(10)));
    queue
        .create_queue(JobType::Summarize.as_str())
        .await
        .expect("create summarize queue");
    let dispatcher = QueueDispatcher::new(
        Arc::clone(&store) as Arc<dyn RunStore>,
        Arc::clone(&queue) as Arc<dyn JobQueue>,
        JobDefaults::default(),
    );
    let ledger = ProgressLedger::new(
        Arc::clone(&store) as Arc<dyn RunStore>,
        Arc::new(dispatcher.clone()),
    );
    LedgerHarness {
        store,
        queue,
        dispatcher,
        ledger,
    }
}

/// Creates a run and moves it straight to RUNNING.
pub async fn running_run(store: &InMemoryRunStore, units: Vec<ProbeUnit>) -> Run {
    let run = store.create_run(units).await.expect("create run");
    assert!(
        store
            .transition_status(run.id, RunStatus::Pending, RunStatus::Running)
            .await
            .expect("start run")
    );
    store.read_run(run.id).await.expect("read run")
}

pub async fn wait_for_status(
    store: &dyn RunStore,
    run_id: RunId,
    expected: RunStatus,
    within: Duration,
) -> Run {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let run = store.read_run(run_id).await.expect("read run");
        if run.status == expected {
            return run;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} stuck in {} waiting for {expected}",
            run.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Probe and summary executor with scripted failures.
#[derive(Default)]
pub struct ScriptedExecutor {
    /// Scenarios that always fail with a non-retryable error.
    pub rejected: HashSet<String>,
    /// Scenarios that fail with a rate limit this many times before succeeding.
    pub flaky: Mutex<HashMap<String, usize>>,
    pub probe_calls: AtomicUsize,
    pub summary_calls: AtomicUsize,
    pub delay: Duration,
    pub summary_delay: Duration,
    summaries_running: AtomicUsize,
    summaries_peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(mut self, scenario: &str) -> Self {
        self.rejected.insert(scenario.to_string());
        self
    }

    pub fn flaky(self, scenario: &str, failures: usize) -> Self {
        self.flaky
            .try_lock()
            .expect("unshared executor")
            .insert(scenario.to_string(), failures);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_summary_delay(mut self, delay: Duration) -> Self {
        self.summary_delay = delay;
        self
    }

    /// Most summaries ever observed running at once.
    pub fn summaries_peak(&self) -> usize {
        self.summaries_peak.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn summary_calls(&self) -> usize {
        self.summary_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeExecutor for ScriptedExecutor {
    async fn execute(&self, job: &ProbeJob) -> Result<(), UpstreamError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.rejected.contains(&job.scenario_id) {
            return Err(UpstreamError::new(
                UpstreamErrorCode::ValidationError,
                "scenario rejected",
            ));
        }
        let mut flaky = self.flaky.lock().await;
        if let Some(remaining) = flaky.get_mut(&job.scenario_id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(UpstreamError::from_status(429, "slow down"));
        }
        Ok(())
    }
}

#[async_trait]
impl SummaryExecutor for ScriptedExecutor {
    async fn summarize(&self, _job: &SummarizeJob) -> Result<(), UpstreamError> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.summaries_running.fetch_add(1, Ordering::SeqCst) + 1;
        self.summaries_peak.fetch_max(running, Ordering::SeqCst);
        if !self.summary_delay.is_zero() {
            tokio::time::sleep(self.summary_delay).await;
        }
        self.summaries_running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
