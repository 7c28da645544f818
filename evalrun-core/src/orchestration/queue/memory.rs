use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::worker::{JobSource, WorkerSet};
use super::{JobHandler, JobQueue, QueueOccupancy};
use crate::error::{OrchestratorError, Result};
use crate::types::{JobId, QueuedJob, RunId, SendRequest};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct ReadyJob {
    job: QueuedJob,
    available_at: Instant,
}

#[derive(Debug, Default)]
struct QueueData {
    ready: VecDeque<ReadyJob>,
    active: HashMap<JobId, QueuedJob>,
    completed: usize,
    failed: Vec<(QueuedJob, String)>,
}

impl QueueData {
    fn holds_singleton(&self, key: &str) -> bool {
        let matches = |job: &QueuedJob| job.options.singleton_key.as_deref() == Some(key);
        self.ready.iter().any(|entry| matches(&entry.job)) || self.active.values().any(matches)
    }
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueData>>,
    notify: Notify,
}

/// Process-local queue with the same delivery semantics as the Postgres
/// backend: singleton keys, delayed retries with backoff, and expiry.
#[derive(Clone)]
pub struct InMemoryJobQueue {
    shared: Arc<Shared>,
    workers: Arc<WorkerSet>,
    poll_interval: Duration,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryJobQueue");
        match self.shared.queues.try_lock() {
            Ok(queues) => {
                debug.field("queue_count", &queues.len());
            }
            Err(_) => {
                debug.field("queues", &"<locked>");
            }
        }
        debug
            .field("workers", &self.workers)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            workers: Arc::new(WorkerSet::new()),
            poll_interval,
        }
    }

    /// Jobs waiting in `queue`, in delivery order.
    pub async fn queued_jobs(&self, queue: &str) -> Vec<QueuedJob> {
        let queues = self.shared.queues.lock().await;
        queues
            .get(queue)
            .map(|data| data.ready.iter().map(|entry| entry.job.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn completed_count(&self, queue: &str) -> usize {
        let queues = self.shared.queues.lock().await;
        queues.get(queue).map(|data| data.completed).unwrap_or(0)
    }

    /// Jobs that exhausted their retries, with the last error message.
    pub async fn failed_jobs(&self, queue: &str) -> Vec<(QueuedJob, String)> {
        let queues = self.shared.queues.lock().await;
        queues
            .get(queue)
            .map(|data| data.failed.clone())
            .unwrap_or_default()
    }

    /// Drops every queued (not active) job for `run_id`, as a crashed backend would.
    pub async fn purge_run(&self, run_id: RunId) -> usize {
        let mut queues = self.shared.queues.lock().await;
        let mut removed = 0;
        for data in queues.values_mut() {
            let before = data.ready.len();
            data.ready
                .retain(|entry| entry.job.payload.run_id() != Some(run_id));
            removed += before - data.ready.len();
        }
        removed
    }

    pub async fn worker_batch_size(&self, queue: &str) -> Option<usize> {
        self.workers.batch_size(queue).await
    }

    /// Jobs currently held by a handler.
    pub fn in_flight(&self) -> usize {
        self.workers.in_flight()
    }
}

#[async_trait]
impl JobSource for Shared {
    async fn fetch(&self, queue: &str, limit: usize) -> Result<Vec<QueuedJob>> {
        let mut queues = self.queues.lock().await;
        let data = queues
            .get_mut(queue)
            .ok_or_else(|| OrchestratorError::Queue(format!("queue {queue} does not exist")))?;
        let now = Instant::now();
        let mut claimed = Vec::new();
        let mut index = 0;
        while claimed.len() < limit && index < data.ready.len() {
            if data.ready[index].available_at <= now {
                if let Some(entry) = data.ready.remove(index) {
                    data.active.insert(entry.job.id, entry.job.clone());
                    claimed.push(entry.job);
                }
            } else {
                index += 1;
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job: &QueuedJob) -> Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(data) = queues.get_mut(&job.queue_name)
            && data.active.remove(&job.id).is_some()
        {
            data.completed += 1;
        }
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, error: &OrchestratorError) -> Result<bool> {
        let mut queues = self.queues.lock().await;
        let Some(data) = queues.get_mut(&job.queue_name) else {
            return Ok(false);
        };
        let Some(mut active) = data.active.remove(&job.id) else {
            return Ok(false);
        };
        if error.is_retryable() && !active.is_final_attempt() {
            active.attempt += 1;
            let delay = active.options.retry_delay(active.attempt);
            data.ready.push_back(ReadyJob {
                job: active,
                available_at: Instant::now() + delay,
            });
            drop(queues);
            self.notify.notify_waiters();
            Ok(false)
        } else {
            data.failed.push((active, error.to_string()));
            Ok(true)
        }
    }

    async fn wait_for_work(&self, _queue: &str, poll: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn create_queue(&self, name: &str) -> Result<()> {
        let mut queues = self.shared.queues.lock().await;
        queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn register_worker(
        &self,
        queue: &str,
        batch_size: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        {
            let queues = self.shared.queues.lock().await;
            if !queues.contains_key(queue) {
                return Err(OrchestratorError::Queue(format!(
                    "queue {queue} does not exist"
                )));
            }
        }
        self.workers
            .start(
                Arc::clone(&self.shared),
                queue,
                batch_size,
                handler,
                self.poll_interval,
            )
            .await
    }

    async fn deregister_worker(&self, queue: &str) -> Result<()> {
        if !self.workers.remove(queue).await {
            tracing::debug!(queue, "deregister requested for queue without a worker");
        }
        Ok(())
    }

    async fn send(&self, queue: &str, request: SendRequest) -> Result<Option<JobId>> {
        let mut queues = self.shared.queues.lock().await;
        let data = queues
            .get_mut(queue)
            .ok_or_else(|| OrchestratorError::Queue(format!("queue {queue} does not exist")))?;
        if let Some(key) = request.options.singleton_key.as_deref()
            && data.holds_singleton(key)
        {
            return Ok(None);
        }
        let job = QueuedJob {
            id: JobId::new(),
            queue_name: queue.to_string(),
            payload: request.payload,
            attempt: 0,
            options: request.options,
        };
        let id = job.id;
        data.ready.push_back(ReadyJob {
            job,
            available_at: Instant::now(),
        });
        drop(queues);
        self.shared.notify.notify_waiters();
        Ok(Some(id))
    }

    async fn shutdown(&self) {
        self.workers.stop_all().await;
    }

    async fn occupancy(&self, queue: &str) -> Result<QueueOccupancy> {
        let queues = self.shared.queues.lock().await;
        let data = queues
            .get(queue)
            .ok_or_else(|| OrchestratorError::Queue(format!("queue {queue} does not exist")))?;
        Ok(QueueOccupancy {
            active: data.active.len(),
            queued: data.ready.len(),
        })
    }

    async fn run_occupancy(&self, run_id: RunId) -> Result<QueueOccupancy> {
        let queues = self.shared.queues.lock().await;
        let mut occupancy = QueueOccupancy::default();
        for data in queues.values() {
            occupancy.queued += data
                .ready
                .iter()
                .filter(|entry| entry.job.payload.run_id() == Some(run_id))
                .count();
            occupancy.active += data
                .active
                .values()
                .filter(|job| job.payload.run_id() == Some(run_id))
                .count();
        }
        Ok(occupancy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuxiliaryJob, JobOptions, JobPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stats_job(run_id: RunId) -> SendRequest {
        SendRequest::new(
            JobPayload::Stats(AuxiliaryJob {
                run_id: Some(run_id),
                data: serde_json::Value::Null,
            }),
            JobOptions::default(),
        )
    }

    #[derive(Default)]
    struct FlakyHandler {
        calls: AtomicUsize,
        fail_first: usize,
        hang: Option<Duration>,
        finished: AtomicUsize,
        exhausted: std::sync::Mutex<Vec<String>>,
    }

    impl FlakyHandler {
        fn failing(fail_first: usize) -> Self {
            Self {
                fail_first,
                ..Self::default()
            }
        }

        fn hanging(hang: Duration) -> Self {
            Self {
                hang: Some(hang),
                ..Self::default()
            }
        }

        fn exhausted(&self) -> Vec<String> {
            self.exhausted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _job: &QueuedJob) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hang) = self.hang {
                tokio::time::sleep(hang).await;
            }
            if call < self.fail_first {
                return Err(OrchestratorError::Internal("transient".into()));
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_exhausted(&self, _job: &QueuedJob, error: &OrchestratorError) -> Result<()> {
            self.exhausted.lock().unwrap().push(error.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn singleton_key_merges_duplicates() {
        let queue = InMemoryJobQueue::new();
        queue.create_queue("stats").await.unwrap();
        let run_id = RunId::new();
        let mut request = stats_job(run_id);
        request.options = request.options.with_singleton_key("stats:1");

        assert!(queue.send("stats", request.clone()).await.unwrap().is_some());
        assert!(queue.send("stats", request).await.unwrap().is_none());
        assert_eq!(
            queue.run_occupancy(run_id).await.unwrap(),
            QueueOccupancy {
                active: 0,
                queued: 1
            }
        );
    }

    #[tokio::test]
    async fn send_to_missing_queue_fails() {
        let queue = InMemoryJobQueue::new();
        let err = queue.send("nope", stats_job(RunId::new())).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Queue(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_redelivered_with_backoff() {
        let queue = InMemoryJobQueue::with_poll_interval(Duration::from_millis(50));
        queue.create_queue("stats").await.unwrap();
        let handler = Arc::new(FlakyHandler::failing(2));
        queue
            .register_worker("stats", 1, Arc::clone(&handler) as Arc<dyn JobHandler>)
            .await
            .unwrap();
        queue.send("stats", stats_job(RunId::new())).await.unwrap();

        // 5s then 10s of backoff before the third attempt.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.completed_count("stats").await, 1);
        assert!(queue.failed_jobs("stats").await.is_empty());
        assert!(handler.exhausted().is_empty());
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_mark_job_failed() {
        let queue = InMemoryJobQueue::with_poll_interval(Duration::from_millis(50));
        queue.create_queue("stats").await.unwrap();
        let handler = Arc::new(FlakyHandler::failing(usize::MAX));
        queue
            .register_worker("stats", 1, Arc::clone(&handler) as Arc<dyn JobHandler>)
            .await
            .unwrap();
        let mut request = stats_job(RunId::new());
        request.options.retry_limit = 1;
        request.options.retry_delay_secs = 1;
        queue.send("stats", request).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.failed_jobs("stats").await.len(), 1);
        assert_eq!(handler.exhausted().len(), 1, "handler told once, after the last attempt");
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn expired_final_attempt_is_reported_to_the_handler() {
        let queue = InMemoryJobQueue::with_poll_interval(Duration::from_millis(50));
        queue.create_queue("stats").await.unwrap();
        let handler = Arc::new(FlakyHandler::hanging(Duration::from_secs(3_600)));
        queue
            .register_worker("stats", 1, Arc::clone(&handler) as Arc<dyn JobHandler>)
            .await
            .unwrap();
        let mut request = stats_job(RunId::new());
        request.options.retry_limit = 0;
        request.options.expire_in_secs = 1;
        queue.send("stats", request).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.finished.load(Ordering::SeqCst), 0);
        assert_eq!(queue.failed_jobs("stats").await.len(), 1);
        let exhausted = handler.exhausted();
        assert_eq!(exhausted.len(), 1);
        assert!(exhausted[0].contains("expired"), "{}", exhausted[0]);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_jobs() {
        let queue = InMemoryJobQueue::with_poll_interval(Duration::from_millis(50));
        queue.create_queue("stats").await.unwrap();
        let handler = Arc::new(FlakyHandler::hanging(Duration::from_secs(5)));
        queue
            .register_worker("stats", 2, Arc::clone(&handler) as Arc<dyn JobHandler>)
            .await
            .unwrap();
        for _ in 0..2 {
            queue.send("stats", stats_job(RunId::new())).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.in_flight(), 2);
        assert_eq!(handler.finished.load(Ordering::SeqCst), 0);

        queue.shutdown().await;
        assert_eq!(handler.finished.load(Ordering::SeqCst), 2);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.completed_count("stats").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deregistering_lets_running_jobs_finish() {
        let queue = InMemoryJobQueue::with_poll_interval(Duration::from_millis(50));
        queue.create_queue("stats").await.unwrap();
        let handler = Arc::new(FlakyHandler::hanging(Duration::from_secs(5)));
        queue
            .register_worker("stats", 1, Arc::clone(&handler) as Arc<dyn JobHandler>)
            .await
            .unwrap();
        queue.send("stats", stats_job(RunId::new())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        queue.deregister_worker("stats").await.unwrap();
        assert_eq!(queue.in_flight(), 1, "deregistering does not wait or abort");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
        assert_eq!(queue.completed_count("stats").await, 1);
    }
}
