mod support;

use std::collections::HashSet;

use evalrun_core::OrchestratorError;
use evalrun_core::persistence::RunStore;
use evalrun_core::types::{
    AuxiliaryJob, JobPayload, ProbeJob, ProbeOutcome, ProgressDelta, RunId, RunStatus, SummarizeJob,
};
use support::{ledger_harness, running_run, units};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_outcomes_move_the_run_to_summarizing_once() {
    let h = ledger_harness().await;
    let units = units("openai", 10);
    let run_id = h.store.create_run(units.clone()).await.expect("create run").id;

    let mut tasks = Vec::new();
    for (index, unit) in units.iter().enumerate() {
        let outcome = if index < 7 {
            ProbeOutcome::Succeeded
        } else {
            ProbeOutcome::Failed
        };
        // Every unit is reported twice, as an at-least-once queue may do.
        for _ in 0..2 {
            let ledger = h.ledger.clone();
            let unit = unit.clone();
            tasks.push(tokio::spawn(async move {
                ledger.record_probe_outcome(run_id, &unit, outcome).await
            }));
        }
    }
    for task in tasks {
        task.await.expect("join").expect("record outcome");
    }

    let run = h.store.read_run(run_id).await.expect("read run");
    assert_eq!(run.status, RunStatus::Summarizing);
    assert_eq!(run.progress.completed, 7);
    assert_eq!(run.progress.failed, 3);
    assert!(run.started_at.is_some());

    let summarize = run.summarize_progress.expect("summarize progress initialized");
    assert_eq!(summarize.total, 7);
    assert_eq!(summarize.processed(), 0);

    let jobs = h.queue.queued_jobs("summarize").await;
    assert_eq!(jobs.len(), 7, "exactly one summarize job per succeeded unit");
    assert!(
        jobs.iter()
            .all(|job| matches!(&job.payload, JobPayload::Summarize(s) if s.run_id == run.id))
    );

    let report = h.ledger.get_progress(run.id).await.expect("progress");
    assert_eq!(report.percent_complete, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn raw_increments_never_exceed_total() {
    let h = ledger_harness().await;
    let run_id = running_run(&h.store, units("openai", 5)).await.id;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let ledger = h.ledger.clone();
        tasks.push(tokio::spawn(
            async move { ledger.increment_completed(run_id).await },
        ));
    }
    for task in tasks {
        task.await.expect("join").expect("increment");
    }

    let run = h.store.read_run(run_id).await.expect("read run");
    assert_eq!(run.progress.completed, 5);
    assert_eq!(run.progress.failed, 0);
    assert_eq!(run.status, RunStatus::Summarizing);
    assert_eq!(h.queue.queued_jobs("summarize").await.len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counter_increments_summarize_each_succeeded_unit_once() {
    let h = ledger_harness().await;
    let run_id = h
        .store
        .create_run(units("openai", 10))
        .await
        .expect("create run")
        .id;

    let mut tasks = Vec::new();
    for index in 0..10 {
        let ledger = h.ledger.clone();
        tasks.push(tokio::spawn(async move {
            if index % 3 == 0 && index > 0 {
                ledger.increment_failed(run_id).await
            } else {
                ledger.increment_completed(run_id).await
            }
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("increment");
    }

    let run = h.store.read_run(run_id).await.expect("read run");
    assert_eq!(
        (run.progress.total, run.progress.completed, run.progress.failed),
        (10, 7, 3)
    );
    assert_eq!(run.status, RunStatus::Summarizing);
    assert_eq!(run.summarize_progress.map(|p| p.total), Some(7));

    let jobs = h.queue.queued_jobs("summarize").await;
    let summarized: HashSet<_> = jobs
        .iter()
        .filter_map(|job| match &job.payload {
            JobPayload::Summarize(s) if s.run_id == run_id => Some(s.unit()),
            _ => None,
        })
        .collect();
    assert_eq!(jobs.len(), 7);
    assert_eq!(summarized.len(), 7, "one summarize job per distinct unit");
    assert!(h.store.pending_probe_units(run_id).await.expect("pending").is_empty());
}

#[tokio::test]
async fn paused_runs_do_not_count_completions() {
    let h = ledger_harness().await;
    let units = units("openai", 3);
    let run = running_run(&h.store, units.clone()).await;
    assert!(
        h.store
            .transition_status(run.id, RunStatus::Running, RunStatus::Paused)
            .await
            .expect("pause")
    );

    let state = h
        .ledger
        .record_probe_outcome(run.id, &units[0], ProbeOutcome::Succeeded)
        .await
        .expect("record while paused");
    assert_eq!(state.status, RunStatus::Paused);
    assert_eq!(state.progress.processed(), 0);
    assert_eq!(h.store.pending_probe_units(run.id).await.expect("pending").len(), 3);

    assert!(
        h.store
            .transition_status(run.id, RunStatus::Paused, RunStatus::Running)
            .await
            .expect("resume")
    );
    let state = h
        .ledger
        .record_probe_outcome(run.id, &units[0], ProbeOutcome::Succeeded)
        .await
        .expect("record after resume");
    assert_eq!(state.status, RunStatus::Running);
    assert_eq!(state.progress.completed, 1);
}

#[tokio::test]
async fn completed_runs_ignore_late_progress() {
    let h = ledger_harness().await;
    let units = units("openai", 2);
    let run = running_run(&h.store, units.clone()).await;
    for unit in &units {
        h.ledger
            .record_probe_outcome(run.id, unit, ProbeOutcome::Failed)
            .await
            .expect("record");
    }
    let run = h.store.read_run(run.id).await.expect("read run");
    assert_eq!(run.status, RunStatus::Completed, "nothing succeeded, nothing to summarize");

    let state = h
        .ledger
        .update_progress(run.id, ProgressDelta::COMPLETED)
        .await
        .expect("late increment");
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.progress.failed, 2);
    assert_eq!(state.progress.completed, 0);
}

#[tokio::test]
async fn summarize_stage_completes_the_run() {
    let h = ledger_harness().await;
    let units = units("openai", 2);
    let run = running_run(&h.store, units.clone()).await;
    for unit in &units {
        h.ledger
            .record_probe_outcome(run.id, unit, ProbeOutcome::Succeeded)
            .await
            .expect("record probe");
    }
    assert_eq!(
        h.store.read_run(run.id).await.expect("read").status,
        RunStatus::Summarizing
    );

    let first = h
        .ledger
        .record_summary_outcome(run.id, &units[0], ProbeOutcome::Succeeded)
        .await
        .expect("first summary");
    assert_eq!(first.status, RunStatus::Summarizing);
    assert_eq!(first.progress.completed, 1);

    let duplicate = h
        .ledger
        .record_summary_outcome(run.id, &units[0], ProbeOutcome::Failed)
        .await
        .expect("duplicate summary");
    assert_eq!(duplicate.progress.completed, 1);
    assert_eq!(duplicate.progress.failed, 0);

    let last = h
        .ledger
        .record_summary_outcome(run.id, &units[1], ProbeOutcome::Failed)
        .await
        .expect("last summary");
    assert_eq!(last.status, RunStatus::Completed);

    let run = h.store.read_run(run.id).await.expect("read run");
    let summarize = run.summarize_progress.expect("summarize progress");
    assert_eq!((summarize.completed, summarize.failed), (1, 1));
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn abandoned_jobs_count_as_failed_once() {
    let h = ledger_harness().await;
    let units = units("openai", 2);
    let run = running_run(&h.store, units.clone()).await;
    h.ledger
        .record_probe_outcome(run.id, &units[0], ProbeOutcome::Succeeded)
        .await
        .expect("record probe");

    let probe = JobPayload::Probe(ProbeJob::for_unit(run.id, &units[1]));
    let state = h
        .ledger
        .record_abandoned_job(&probe)
        .await
        .expect("abandon probe")
        .expect("probe jobs are counted");
    assert_eq!(state.status, RunStatus::Summarizing);
    assert_eq!((state.progress.completed, state.progress.failed), (1, 1));

    // A second report for the same unit changes nothing.
    h.ledger
        .record_abandoned_job(&probe)
        .await
        .expect("abandon probe again");
    let run_now = h.store.read_run(run.id).await.expect("read");
    assert_eq!((run_now.progress.completed, run_now.progress.failed), (1, 1));

    let summarize = JobPayload::Summarize(SummarizeJob::for_unit(run.id, &units[0]));
    let state = h
        .ledger
        .record_abandoned_job(&summarize)
        .await
        .expect("abandon summarize")
        .expect("summarize jobs are counted");
    assert_eq!(state.status, RunStatus::Completed);
    let summarize_progress = h
        .store
        .read_run(run.id)
        .await
        .expect("read")
        .summarize_progress
        .expect("summarize progress");
    assert_eq!((summarize_progress.completed, summarize_progress.failed), (0, 1));

    let stats = JobPayload::Stats(AuxiliaryJob {
        run_id: Some(run.id),
        data: serde_json::Value::Null,
    });
    assert!(
        h.ledger
            .record_abandoned_job(&stats)
            .await
            .expect("abandon stats")
            .is_none()
    );
}

#[tokio::test]
async fn reconcile_applies_a_missed_transition() {
    let h = ledger_harness().await;
    let units = units("openai", 2);
    let run = running_run(&h.store, units.clone()).await;
    // Outcomes land in the store but the process dies before transitioning.
    for unit in &units {
        h.store
            .record_probe_outcome(run.id, unit, ProbeOutcome::Succeeded)
            .await
            .expect("record");
    }
    assert_eq!(
        h.store.read_run(run.id).await.expect("read").status,
        RunStatus::Running
    );

    let applied = h.ledger.reconcile_status(run.id).await.expect("reconcile");
    assert_eq!(applied, Some(RunStatus::Summarizing));
    assert_eq!(h.queue.queued_jobs("summarize").await.len(), 2);

    let again = h.ledger.reconcile_status(run.id).await.expect("reconcile");
    assert_eq!(again, None);
    assert_eq!(h.queue.queued_jobs("summarize").await.len(), 2);
}

#[tokio::test]
async fn missing_run_surfaces_not_found() {
    let h = ledger_harness().await;
    let err = h
        .ledger
        .increment_completed(RunId::new())
        .await
        .expect_err("unknown run");
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}
