#![cfg(feature = "pg-tests")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use evalrun_core::orchestration::{
    JobHandler, JobQueue, OrchestratorConfig, ProviderLimitsSource, RecoveryAction,
    RunOrchestrator,
};
use evalrun_core::persistence::RunStore;
use evalrun_core::persistence::postgres::{
    PostgresJobQueue, PostgresProviderLimits, PostgresRunStore,
};
use evalrun_core::types::{
    AuxiliaryJob, JobOptions, JobPayload, ProbeJob, ProbeOutcome, ProbeUnit, ProgressDelta,
    ProviderLimits, QueuedJob, RunStatus, SendRequest,
};
use evalrun_core::{OrchestratorError, Result};
use sqlx::PgPool;

fn units(count: usize) -> Vec<ProbeUnit> {
    (0..count)
        .map(|i| ProbeUnit::new("openai", "gpt-4o", format!("scenario-{i:02}")))
        .collect()
}

#[sqlx::test(migrator = "evalrun_core::MIGRATOR")]
async fn conditional_increment_respects_total_and_status(pool: PgPool) {
    let store = PostgresRunStore::new(pool);
    let run = store.create_run(units(2)).await.expect("create");
    assert_eq!(run.progress.total, 2);

    let first = store
        .conditional_increment(run.id, ProgressDelta::COMPLETED)
        .await
        .expect("increment");
    assert!(first.applied);
    let overshoot = store
        .conditional_increment(
            run.id,
            ProgressDelta {
                completed: 1,
                failed: 1,
            },
        )
        .await
        .expect("overshoot");
    assert!(!overshoot.applied);
    assert_eq!(overshoot.state.progress.completed, 1);

    assert!(
        store
            .transition_status(run.id, RunStatus::Pending, RunStatus::Paused)
            .await
            .expect("pause")
    );
    let paused = store
        .conditional_increment(run.id, ProgressDelta::FAILED)
        .await
        .expect("paused increment");
    assert!(!paused.applied);
    assert_eq!(paused.state.status, RunStatus::Paused);
}

#[sqlx::test(migrator = "evalrun_core::MIGRATOR")]
async fn concurrent_outcomes_are_counted_once(pool: PgPool) {
    let store = Arc::new(PostgresRunStore::new(pool));
    let units = units(8);
    let run = store.create_run(units.clone()).await.expect("create");

    let mut tasks = Vec::new();
    for unit in units.iter().chain(units.iter()) {
        let store = Arc::clone(&store);
        let unit = unit.clone();
        let run_id = run.id;
        tasks.push(tokio::spawn(async move {
            store
                .record_probe_outcome(run_id, &unit, ProbeOutcome::Succeeded)
                .await
        }));
    }
    let mut applied = 0;
    for task in tasks {
        if task.await.expect("join").expect("record").applied {
            applied += 1;
        }
    }
    assert_eq!(applied, 8);

    let run = store.read_run(run.id).await.expect("read");
    assert_eq!(run.progress.completed, 8);
    assert!(store.pending_probe_units(run.id).await.expect("pending").is_empty());
    assert_eq!(store.unsummarized_units(run.id).await.expect("unsummarized").len(), 8);
}

#[sqlx::test(migrator = "evalrun_core::MIGRATOR")]
async fn transition_stamps_timestamps(pool: PgPool) {
    let store = PostgresRunStore::new(pool);
    let run = store.create_run(units(1)).await.expect("create");
    assert!(
        store
            .transition_status(run.id, RunStatus::Pending, RunStatus::Running)
            .await
            .expect("start")
    );
    assert!(
        !store
            .transition_status(run.id, RunStatus::Pending, RunStatus::Running)
            .await
            .expect("stale cas")
    );
    assert!(
        store
            .transition_status(run.id, RunStatus::Running, RunStatus::Cancelled)
            .await
            .expect("cancel")
    );
    let run = store.read_run(run.id).await.expect("read");
    assert!(run.started_at.is_some());
    assert!(run.completed_at.is_some());
}

#[sqlx::test(migrator = "evalrun_core::MIGRATOR")]
async fn resuming_a_run_paused_before_it_started_stamps_started_at(pool: PgPool) {
    let store = PostgresRunStore::new(pool);
    let run = store.create_run(units(1)).await.expect("create");
    assert!(
        store
            .transition_status(run.id, RunStatus::Pending, RunStatus::Paused)
            .await
            .expect("pause")
    );
    assert!(store.read_run(run.id).await.expect("read").started_at.is_none());

    assert!(
        store
            .transition_status(run.id, RunStatus::Paused, RunStatus::Running)
            .await
            .expect("resume")
    );
    let started_at = store.read_run(run.id).await.expect("read").started_at;
    assert!(started_at.is_some());

    for (from, to) in [
        (RunStatus::Running, RunStatus::Paused),
        (RunStatus::Paused, RunStatus::Running),
    ] {
        assert!(store.transition_status(run.id, from, to).await.expect("cas"));
    }
    assert_eq!(
        store.read_run(run.id).await.expect("read").started_at,
        started_at,
        "first start is kept"
    );
}

#[sqlx::test(migrator = "evalrun_core::MIGRATOR")]
async fn counter_increments_claim_pending_units(pool: PgPool) {
    let store = PostgresRunStore::new(pool);
    let units = units(4);
    let run = store.create_run(units.clone()).await.expect("create");
    assert!(
        store
            .transition_status(run.id, RunStatus::Pending, RunStatus::Running)
            .await
            .expect("start")
    );

    let applied = store
        .conditional_increment(
            run.id,
            ProgressDelta {
                completed: 2,
                failed: 1,
            },
        )
        .await
        .expect("increment");
    assert!(applied.applied);

    assert_eq!(
        store.pending_probe_units(run.id).await.expect("pending"),
        vec![units[3].clone()]
    );
    assert_eq!(
        store.unsummarized_units(run.id).await.expect("unsummarized"),
        units[..2].to_vec()
    );

    let late = store
        .record_probe_outcome(run.id, &units[0], ProbeOutcome::Failed)
        .await
        .expect("late outcome");
    assert!(!late.applied, "unit already has an outcome");
    assert_eq!(late.state.progress.processed(), 3);
}

#[sqlx::test(migrator = "evalrun_core::MIGRATOR")]
async fn database_failures_keep_their_sqlx_source(pool: PgPool) {
    let store = PostgresRunStore::new(pool.clone());
    let run = store.create_run(units(1)).await.expect("create");
    pool.close().await;

    let err = store
        .conditional_increment(run.id, ProgressDelta::COMPLETED)
        .await
        .expect_err("pool is closed");
    assert!(matches!(err, OrchestratorError::Database(_)), "{err:?}");
    let err = store.create_run(units(1)).await.expect_err("pool is closed");
    assert!(matches!(err, OrchestratorError::Database(_)), "{err:?}");
}

fn stats_request(key: &str) -> SendRequest {
    SendRequest::new(
        JobPayload::Stats(AuxiliaryJob {
            run_id: None,
            data: serde_json::Value::Null,
        }),
        JobOptions::default().with_singleton_key(key),
    )
}

#[sqlx::test(migrator = "evalrun_core::MIGRATOR")]
async fn singleton_keys_merge_live_jobs(pool: PgPool) {
    let queue = PostgresJobQueue::new(pool);
    queue.create_queue("stats").await.expect("create queue");

    let first = queue.send("stats", stats_request("nightly")).await.expect("send");
    let second = queue.send("stats", stats_request("nightly")).await.expect("send");
    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(queue.occupancy("stats").await.expect("occupancy").queued, 1);

    let missing = queue.send("nope", stats_request("x")).await;
    assert!(matches!(missing, Err(OrchestratorError::Queue(_))));
}

struct CountingHandler(tokio::sync::mpsc::UnboundedSender<QueuedJob>);

#[async_trait]
impl JobHandler for CountingHandler {
    async fn handle(&self, job: &QueuedJob) -> Result<()> {
        let _ = self.0.send(job.clone());
        Ok(())
    }
}

#[sqlx::test(migrator = "evalrun_core::MIGRATOR")]
async fn workers_claim_and_complete_jobs(pool: PgPool) {
    let queue = PostgresJobQueue::with_poll_interval(pool, Duration::from_millis(20));
    queue.create_queue("stats").await.expect("create queue");
    for key in ["a", "b", "c"] {
        queue.send("stats", stats_request(key)).await.expect("send");
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    queue
        .register_worker("stats", 2, Arc::new(CountingHandler(tx)))
        .await
        .expect("register");
    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("job delivered")
            .expect("channel open");
    }
    queue.shutdown().await;

    let occupancy = queue.occupancy("stats").await.expect("occupancy");
    assert_eq!(occupancy.queued, 0);
}

#[sqlx::test(migrator = "evalrun_core::MIGRATOR")]
async fn provider_limits_come_from_the_table(pool: PgPool) {
    let limits = PostgresProviderLimits::new(pool);
    limits
        .upsert(&ProviderLimits::new("openai", 4, 120))
        .await
        .expect("upsert");
    limits
        .upsert(&ProviderLimits::new("openai", 2, 60))
        .await
        .expect("update");
    let all = limits.load_all().await.expect("load");
    assert_eq!(all, vec![ProviderLimits::new("openai", 2, 60)]);
}

#[sqlx::test(migrator = "evalrun_core::MIGRATOR")]
async fn orphaned_run_is_recovered(pool: PgPool) {
    let store = Arc::new(PostgresRunStore::new(pool.clone()));
    let queue = Arc::new(PostgresJobQueue::new(pool.clone()));
    let mut config = OrchestratorConfig::default();
    config.recovery.run_on_startup = false;
    let orchestrator = RunOrchestrator::builder(config)
        .with_store(Arc::clone(&store) as Arc<dyn RunStore>)
        .with_queue(Arc::clone(&queue) as Arc<dyn JobQueue>)
        .with_limits_source(Arc::new(PostgresProviderLimits::new(pool.clone()))
            as Arc<dyn ProviderLimitsSource>)
        .build()
        .expect("build");
    orchestrator.register_handlers().await.expect("topology");

    let units = units(10);
    let run = orchestrator.create_run(units.clone()).await.expect("create");
    let jobs: Vec<ProbeJob> = units.iter().map(|u| ProbeJob::for_unit(run.id, u)).collect();
    orchestrator
        .start_run_dispatch(run.id, &jobs)
        .await
        .expect("dispatch");
    for unit in &units[..4] {
        orchestrator
            .record_probe_outcome(run.id, unit, ProbeOutcome::Succeeded)
            .await
            .expect("record");
    }

    sqlx::query("DELETE FROM run_jobs WHERE run_id = $1")
        .bind(run.id.as_uuid())
        .execute(&pool)
        .await
        .expect("lose jobs");
    store
        .set_updated_at(run.id, Utc::now() - chrono::Duration::minutes(10))
        .await
        .expect("backdate");

    let orphans = orchestrator.detect_orphaned_runs().await.expect("detect");
    assert_eq!(orphans.len(), 1);
    let outcome = orchestrator
        .recover_orphaned_run(&orphans[0])
        .await
        .expect("recover");
    assert_eq!(outcome.action, RecoveryAction::Requeued);
    assert_eq!(outcome.requeued, 6);
    assert_eq!(
        queue.occupancy("probe_openai").await.expect("occupancy").queued,
        6
    );
    assert!(orchestrator.detect_orphaned_runs().await.expect("detect").is_empty());
}
