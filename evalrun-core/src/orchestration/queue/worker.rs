//! Worker loop shared by every queue backend.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::JobHandler;
use crate::error::{OrchestratorError, Result};
use crate::types::QueuedJob;

/// Backend operations the worker loop needs.
#[async_trait]
pub trait JobSource: Send + Sync + 'static {
    /// Claims up to `limit` ready jobs, marking them active.
    async fn fetch(&self, queue: &str, limit: usize) -> Result<Vec<QueuedJob>>;

    async fn complete(&self, job: &QueuedJob) -> Result<()>;

    /// Schedules a retry when the error is retryable and the job has budget
    /// left; otherwise marks it failed. Returns true only when this call
    /// marked the job failed for good.
    async fn fail(&self, job: &QueuedJob, error: &OrchestratorError) -> Result<bool>;

    /// Settles jobs on `queue` whose lease ran out without the worker that
    /// claimed them reporting back. Returns the ones that had no attempts
    /// left and were marked failed.
    async fn reap_expired(&self, _queue: &str) -> Result<Vec<QueuedJob>> {
        Ok(Vec::new())
    }

    /// Resolves when new work may be available, or after `poll` at the latest.
    async fn wait_for_work(&self, queue: &str, poll: Duration);
}

/// Running worker for one queue.
pub struct WorkerHandle {
    queue: String,
    batch_size: usize,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("queue", &self.queue)
            .field("batch_size", &self.batch_size)
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl WorkerHandle {
    /// Starts the fetch loop. Jobs run on `jobs`, so whoever owns the tracker
    /// can wait for them after the loop is gone.
    pub fn spawn<S>(
        source: Arc<S>,
        queue: &str,
        batch_size: usize,
        handler: Arc<dyn JobHandler>,
        poll_interval: Duration,
        jobs: TaskTracker,
    ) -> Self
    where
        S: JobSource,
    {
        let token = CancellationToken::new();
        let batch_size = batch_size.max(1);
        let task = tokio::spawn(run_worker(
            source,
            queue.to_string(),
            batch_size,
            handler,
            poll_interval,
            token.clone(),
            jobs,
        ));
        Self {
            queue: queue.to_string(),
            batch_size,
            token,
            task,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Stops the fetch loop. In-flight jobs keep running on the tracker.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(queue = %self.queue, "worker loop ended abnormally: {err}");
        }
    }
}

async fn run_worker<S>(
    source: Arc<S>,
    queue: String,
    batch_size: usize,
    handler: Arc<dyn JobHandler>,
    poll_interval: Duration,
    token: CancellationToken,
    jobs: TaskTracker,
) where
    S: JobSource,
{
    let permits = Arc::new(Semaphore::new(batch_size));
    tracing::debug!(queue = %queue, batch_size, "worker started");

    loop {
        let first = tokio::select! {
            _ = token.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let mut claimed = vec![first];
        while let Ok(permit) = Arc::clone(&permits).try_acquire_owned() {
            claimed.push(permit);
        }

        match source.reap_expired(&queue).await {
            Ok(expired) => {
                for job in expired {
                    let err = OrchestratorError::Expired(format!(
                        "job {} lease ran out on its final attempt",
                        job.id
                    ));
                    report_exhausted(handler.as_ref(), &job, &err).await;
                }
            }
            Err(err) => tracing::warn!(queue = %queue, "expired job scan failed: {err}"),
        }

        let batch = match source.fetch(&queue, claimed.len()).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(queue = %queue, "fetch failed: {err}");
                drop(claimed);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                continue;
            }
        };

        if batch.is_empty() {
            drop(claimed);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = source.wait_for_work(&queue, poll_interval) => {}
            }
            continue;
        }

        let mut claimed = claimed.into_iter();
        for job in batch {
            let permit = claimed.next();
            let source = Arc::clone(&source);
            let handler = Arc::clone(&handler);
            jobs.spawn(async move {
                execute_job(source.as_ref(), handler.as_ref(), job).await;
                drop(permit);
            });
        }
    }

    tracing::debug!(queue = %queue, "worker stopped pulling jobs");
}

async fn execute_job<S>(source: &S, handler: &dyn JobHandler, job: QueuedJob)
where
    S: JobSource,
{
    let expire_in = job.options.expire_in();
    let outcome = match tokio::time::timeout(
        expire_in,
        AssertUnwindSafe(handler.handle(&job)).catch_unwind(),
    )
    .await
    {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(OrchestratorError::Internal(format!(
            "handler panicked while processing job {}",
            job.id
        ))),
        Err(_) => Err(OrchestratorError::Expired(format!(
            "job {} exceeded {}s",
            job.id,
            expire_in.as_secs()
        ))),
    };

    let settle = match &outcome {
        Ok(()) => source.complete(&job).await,
        Err(err) => {
            tracing::warn!(
                queue = %job.queue_name,
                job = %job.id,
                attempt = job.attempt,
                retryable = err.is_retryable(),
                "job failed: {err}"
            );
            match source.fail(&job, err).await {
                Ok(true) => {
                    report_exhausted(handler, &job, err).await;
                    Ok(())
                }
                Ok(false) => Ok(()),
                Err(settle_err) => Err(settle_err),
            }
        }
    };
    if let Err(err) = settle {
        tracing::error!(queue = %job.queue_name, job = %job.id, "failed to settle job: {err}");
    }
}

async fn report_exhausted(handler: &dyn JobHandler, job: &QueuedJob, error: &OrchestratorError) {
    if let Err(err) = handler.on_exhausted(job, error).await {
        tracing::error!(
            queue = %job.queue_name,
            job = %job.id,
            "failed to record exhausted job: {err}"
        );
    }
}

/// Registry of running workers keyed by queue name. Every job they start is
/// tracked here until it settles.
#[derive(Default)]
pub struct WorkerSet {
    workers: Mutex<HashMap<String, WorkerHandle>>,
    jobs: TaskTracker,
}

impl fmt::Debug for WorkerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WorkerSet");
        match self.workers.try_lock() {
            Ok(workers) => {
                debug.field("queues", &workers.keys().collect::<Vec<_>>());
            }
            Err(_) => {
                debug.field("workers", &"<locked>");
            }
        }
        debug.field("in_flight", &self.jobs.len()).finish()
    }
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a worker for `queue`, refusing when the queue already has one.
    pub async fn start<S>(
        &self,
        source: Arc<S>,
        queue: &str,
        batch_size: usize,
        handler: Arc<dyn JobHandler>,
        poll_interval: Duration,
    ) -> Result<()>
    where
        S: JobSource,
    {
        let handle = WorkerHandle::spawn(
            source,
            queue,
            batch_size,
            handler,
            poll_interval,
            self.jobs.clone(),
        );
        self.insert(queue, handle).await
    }

    /// Jobs handed to a handler that have not settled yet.
    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    /// Installs `handle`, refusing when the queue already has a worker.
    pub async fn insert(&self, queue: &str, handle: WorkerHandle) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(queue) {
            drop(workers);
            handle.stop().await;
            return Err(OrchestratorError::Queue(format!(
                "queue {queue} already has a worker; deregister it first"
            )));
        }
        workers.insert(queue.to_string(), handle);
        Ok(())
    }

    pub async fn remove(&self, queue: &str) -> bool {
        let handle = {
            let mut workers = self.workers.lock().await;
            workers.remove(queue)
        };
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn batch_size(&self, queue: &str) -> Option<usize> {
        let workers = self.workers.lock().await;
        workers.get(queue).map(WorkerHandle::batch_size)
    }

    /// Stops every fetch loop, then waits for the jobs they started.
    pub async fn stop_all(&self) {
        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock().await;
            workers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.stop().await;
        }

        let in_flight = self.jobs.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "waiting for in-flight jobs to settle");
        }
        self.jobs.close();
        self.jobs.wait().await;
        self.jobs.reopen();
    }
}
