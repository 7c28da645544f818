use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use evalrun_core::Result;
use evalrun_core::orchestration::{
    CachedProviderLimits, HandlerSet, InMemoryJobQueue, JobHandler, JobQueue, LimiterConfig,
    LimiterRegistry, ProviderLimitsSource, QueueConfig, QueueOccupancy, QueueTopology,
};
use evalrun_core::types::{JobId, JobType, ProviderLimits, QueuedJob, RunId, SendRequest};

struct NoopHandler;

#[async_trait]
impl JobHandler for NoopHandler {
    async fn handle(&self, _job: &QueuedJob) -> Result<()> {
        Ok(())
    }
}

/// Limits an administrator can edit between calls.
#[derive(Default)]
struct EditableLimits {
    limits: StdMutex<Vec<ProviderLimits>>,
}

impl EditableLimits {
    fn set(&self, limits: Vec<ProviderLimits>) {
        *self.limits.lock().expect("limits lock") = limits;
    }
}

#[async_trait]
impl ProviderLimitsSource for EditableLimits {
    async fn load_all(&self) -> Result<Vec<ProviderLimits>> {
        Ok(self.limits.lock().expect("limits lock").clone())
    }
}

/// Records the order of topology calls before delegating.
struct RecordingQueue {
    inner: InMemoryJobQueue,
    calls: StdMutex<Vec<String>>,
}

impl RecordingQueue {
    fn new() -> Self {
        Self {
            inner: InMemoryJobQueue::new(),
            calls: StdMutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn log(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn create_queue(&self, name: &str) -> Result<()> {
        self.log(format!("create:{name}"));
        self.inner.create_queue(name).await
    }

    async fn register_worker(
        &self,
        queue: &str,
        batch_size: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        self.log(format!("register:{queue}:{batch_size}"));
        self.inner.register_worker(queue, batch_size, handler).await
    }

    async fn deregister_worker(&self, queue: &str) -> Result<()> {
        self.log(format!("deregister:{queue}"));
        self.inner.deregister_worker(queue).await
    }

    async fn send(&self, queue: &str, request: SendRequest) -> Result<Option<JobId>> {
        self.inner.send(queue, request).await
    }

    async fn occupancy(&self, queue: &str) -> Result<QueueOccupancy> {
        self.inner.occupancy(queue).await
    }

    async fn run_occupancy(&self, run_id: RunId) -> Result<QueueOccupancy> {
        self.inner.run_occupancy(run_id).await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

struct Fixture {
    queue: Arc<RecordingQueue>,
    limits: Arc<EditableLimits>,
    limiters: Arc<LimiterRegistry>,
    topology: QueueTopology,
}

fn fixture(handlers: HandlerSet) -> Fixture {
    let queue = Arc::new(RecordingQueue::new());
    let limits = Arc::new(EditableLimits::default());
    limits.set(vec![
        ProviderLimits::new("openai", 4, 120),
        ProviderLimits::new("anthropic", 2, 60),
    ]);
    let limiters = Arc::new(LimiterRegistry::new(
        Arc::new(CachedProviderLimits::new(
            Arc::clone(&limits) as Arc<dyn ProviderLimitsSource>
        )),
        LimiterConfig::default(),
    ));
    let topology = QueueTopology::new(
        Arc::clone(&queue) as Arc<dyn JobQueue>,
        Arc::clone(&limiters),
        QueueConfig::default(),
        handlers,
    );
    Fixture {
        queue,
        limits,
        limiters,
        topology,
    }
}

fn probe_and_summarize() -> HandlerSet {
    HandlerSet::new()
        .with(JobType::Probe, Arc::new(NoopHandler))
        .with(JobType::Summarize, Arc::new(NoopHandler))
}

#[tokio::test]
async fn queues_are_created_before_any_worker_attaches() {
    let f = fixture(probe_and_summarize());
    let report = f.topology.register_handlers().await.expect("register");

    let calls = f.queue.calls();
    let last_create = calls
        .iter()
        .rposition(|call| call.starts_with("create:"))
        .expect("queues created");
    let first_register = calls
        .iter()
        .position(|call| call.starts_with("register:"))
        .expect("workers attached");
    assert!(last_create < first_register, "call order: {calls:?}");

    assert_eq!(report.created.len(), 6);
    assert!(calls.contains(&"register:probe_openai:4".to_string()));
    assert!(calls.contains(&"register:probe_anthropic:2".to_string()));
    assert!(calls.contains(&"register:summarize:4".to_string()));

    let mut skipped = report.skipped.clone();
    skipped.sort();
    assert_eq!(skipped, vec!["analyze", "expand", "stats"]);

    f.queue.shutdown().await;
}

#[tokio::test]
async fn registering_twice_keeps_existing_workers() {
    let f = fixture(probe_and_summarize());
    let first = f.topology.register_handlers().await.expect("first pass");
    assert_eq!(first.attached.len(), 3);

    let second = f.topology.register_handlers().await.expect("second pass");
    assert!(second.attached.is_empty());
    assert_eq!(
        f.topology.attached_queues().await,
        vec!["probe_anthropic", "probe_openai", "summarize"]
    );

    f.queue.shutdown().await;
}

#[tokio::test]
async fn reregister_resizes_worker_and_limiter() {
    let f = fixture(probe_and_summarize());
    f.topology.register_handlers().await.expect("register");
    assert_eq!(f.queue.inner.worker_batch_size("probe_openai").await, Some(4));
    let before = f.limiters.limiter("openai").await.expect("limiter");
    assert_eq!(before.limits().max_parallel_requests, 4);

    f.limits.set(vec![
        ProviderLimits::new("openai", 1, 30),
        ProviderLimits::new("anthropic", 2, 60),
    ]);
    let limits = f
        .topology
        .reregister_provider_handler("openai")
        .await
        .expect("reregister");
    assert_eq!(limits.max_parallel_requests, 1);
    assert_eq!(f.queue.inner.worker_batch_size("probe_openai").await, Some(1));

    let after = f.limiters.limiter("openai").await.expect("limiter");
    assert_eq!(after.limits().max_parallel_requests, 1);
    assert_eq!(after.limits().requests_per_minute, 30);
    assert!(!Arc::ptr_eq(&before, &after));

    let calls = f.queue.calls();
    let deregister = calls
        .iter()
        .position(|call| call == "deregister:probe_openai")
        .expect("old worker removed");
    let register = calls
        .iter()
        .rposition(|call| call == "register:probe_openai:1")
        .expect("new worker attached");
    assert!(deregister < register);

    f.queue.shutdown().await;
}

#[tokio::test]
async fn unseen_provider_gets_a_queue_on_first_use() {
    let f = fixture(probe_and_summarize());
    let name = f
        .topology
        .ensure_provider_queue("Mistral AI")
        .await
        .expect("provision");
    assert_eq!(name, "probe_mistral_ai");
    assert_eq!(f.queue.inner.worker_batch_size(&name).await, Some(1));

    let again = f
        .topology
        .ensure_provider_queue("Mistral AI")
        .await
        .expect("provision again");
    assert_eq!(again, name);
    let registrations = f
        .queue
        .calls()
        .iter()
        .filter(|call| call.starts_with("register:probe_mistral_ai"))
        .count();
    assert_eq!(registrations, 1);

    f.queue.shutdown().await;
}

#[tokio::test]
async fn probe_queues_without_a_handler_are_skipped() {
    let f = fixture(HandlerSet::new().with(JobType::Summarize, Arc::new(NoopHandler)));
    let report = f.topology.register_handlers().await.expect("register");
    assert!(report.skipped.contains(&"probe_openai".to_string()));
    assert_eq!(report.attached, vec!["summarize"]);
    assert_eq!(f.queue.inner.worker_batch_size("probe_openai").await, None);

    f.queue.shutdown().await;
}
