use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::orchestration::queue::{
    JobHandler, JobQueue, JobSource, QueueOccupancy, WorkerSet,
};
use crate::types::{JobId, JobOptions, JobPayload, QueuedJob, RunId, SendRequest};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const JOB_COLUMNS: &str = "j.id, j.queue_name, j.payload, j.attempt, j.retry_limit, \
     j.retry_delay_secs, j.retry_backoff, j.expire_in_secs, j.singleton_key";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue_name: String,
    payload: serde_json::Value,
    attempt: i32,
    retry_limit: i32,
    retry_delay_secs: i64,
    retry_backoff: bool,
    expire_in_secs: i64,
    singleton_key: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<QueuedJob> {
        let payload: JobPayload = serde_json::from_value(self.payload)
            .map_err(|e| OrchestratorError::InvalidPayload(format!("job {}: {e}", self.id)))?;
        Ok(QueuedJob {
            id: JobId(self.id),
            queue_name: self.queue_name,
            payload,
            attempt: u32::try_from(self.attempt).unwrap_or(0),
            options: JobOptions {
                retry_limit: u32::try_from(self.retry_limit).unwrap_or(0),
                retry_delay_secs: u64::try_from(self.retry_delay_secs).unwrap_or(0),
                retry_backoff: self.retry_backoff,
                expire_in_secs: u64::try_from(self.expire_in_secs).unwrap_or(0),
                singleton_key: self.singleton_key,
            },
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExpiredRow {
    exhausted: bool,
    #[sqlx(flatten)]
    job: JobRow,
}

/// Jobs settled by an expired-lease sweep.
#[derive(Debug, Default)]
pub struct ExpiredJobs {
    /// Returned to their queue for another attempt.
    pub requeued: u64,
    /// Marked failed because their last attempt expired.
    pub exhausted: Vec<QueuedJob>,
}

#[derive(sqlx::FromRow)]
struct OccupancyRow {
    active: i64,
    queued: i64,
}

impl From<OccupancyRow> for QueueOccupancy {
    fn from(row: OccupancyRow) -> Self {
        QueueOccupancy {
            active: usize::try_from(row.active).unwrap_or(0),
            queued: usize::try_from(row.queued).unwrap_or(0),
        }
    }
}

fn db_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| OrchestratorError::Queue(format!("{what} {value} out of range")))
}

fn db_i32(value: u32, what: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| OrchestratorError::Queue(format!("{what} {value} out of range")))
}

#[derive(Debug)]
struct PgJobSource {
    pool: PgPool,
}

impl PgJobSource {
    /// Hands active jobs whose lease ran out back to the queue, or fails them
    /// when their retry budget is spent. `None` scans every queue.
    async fn requeue_expired(&self, queue: Option<&str>) -> Result<ExpiredJobs> {
        let rows = sqlx::query_as::<_, ExpiredRow>(&format!(
            r#"
            UPDATE run_jobs j
            SET state = CASE WHEN attempt >= retry_limit THEN 'failed' ELSE 'ready' END,
                attempt = CASE WHEN attempt >= retry_limit THEN attempt ELSE attempt + 1 END,
                completed_at = CASE WHEN attempt >= retry_limit THEN NOW() ELSE NULL END,
                available_at = NOW(),
                started_at = NULL,
                expires_at = NULL,
                last_error = 'job expired',
                updated_at = NOW()
            WHERE state = 'active'
              AND expires_at < NOW()
              AND ($1::text IS NULL OR queue_name = $1)
            RETURNING j.state = 'failed' AS exhausted, {JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Queue(format!("expired job scan failed: {e}")))?;

        let mut expired = ExpiredJobs::default();
        for row in rows {
            if !row.exhausted {
                expired.requeued += 1;
                continue;
            }
            let id = row.job.id;
            match row.job.into_job() {
                Ok(job) => expired.exhausted.push(job),
                Err(err) => tracing::error!(job = %id, "unreadable expired job: {err}"),
            }
        }
        if expired.requeued > 0 || !expired.exhausted.is_empty() {
            tracing::warn!(
                queue = queue.unwrap_or("*"),
                requeued = expired.requeued,
                exhausted = expired.exhausted.len(),
                "expired jobs settled"
            );
        }
        Ok(expired)
    }

    async fn queue_exists(&self, queue: &str) -> Result<()> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM run_queues WHERE name = $1)")
                .bind(queue)
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(())
        } else {
            Err(OrchestratorError::Queue(format!(
                "queue {queue} does not exist"
            )))
        }
    }
}

#[async_trait]
impl JobSource for PgJobSource {
    async fn fetch(&self, queue: &str, limit: usize) -> Result<Vec<QueuedJob>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            WITH next AS (
                SELECT id
                FROM run_jobs
                WHERE queue_name = $1
                  AND state = 'ready'
                  AND available_at <= NOW()
                ORDER BY available_at, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE run_jobs j
            SET state = 'active',
                started_at = NOW(),
                expires_at = NOW() + j.expire_in_secs * INTERVAL '1 second',
                updated_at = NOW()
            FROM next
            WHERE j.id = next.id
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Queue(format!("dequeue failed: {e}")))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match row.into_job() {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    tracing::error!(queue, job = %id, "unreadable job payload: {err}");
                    sqlx::query(
                        r#"
                        UPDATE run_jobs
                        SET state = 'failed', last_error = $2, completed_at = NOW(), updated_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(id)
                    .bind(err.to_string())
                    .execute(&self.pool)
                    .await?;
                }
            }
        }
        Ok(jobs)
    }

    async fn complete(&self, job: &QueuedJob) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE run_jobs
            SET state = 'completed', completed_at = NOW(), expires_at = NULL, updated_at = NOW()
            WHERE id = $1 AND state = 'active'
            "#,
        )
        .bind(job.id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Queue(format!("complete failed: {e}")))?;
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, error: &OrchestratorError) -> Result<bool> {
        if error.is_retryable() && !job.is_final_attempt() {
            let attempt = job.attempt + 1;
            let delay_ms = u64::try_from(job.options.retry_delay(attempt).as_millis())
                .unwrap_or(u64::MAX);
            sqlx::query(
                r#"
                UPDATE run_jobs
                SET state = 'ready',
                    attempt = $2,
                    available_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                    started_at = NULL,
                    expires_at = NULL,
                    last_error = $4,
                    updated_at = NOW()
                WHERE id = $1 AND state = 'active'
                "#,
            )
            .bind(job.id.0)
            .bind(db_i32(attempt, "attempt")?)
            .bind(db_i64(delay_ms, "retry delay")?)
            .bind(error.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Queue(format!("retry schedule failed: {e}")))?;
            Ok(false)
        } else {
            let result = sqlx::query(
                r#"
                UPDATE run_jobs
                SET state = 'failed',
                    completed_at = NOW(),
                    expires_at = NULL,
                    last_error = $2,
                    updated_at = NOW()
                WHERE id = $1 AND state = 'active'
                "#,
            )
            .bind(job.id.0)
            .bind(error.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Queue(format!("fail update failed: {e}")))?;
            // Zero rows: an expiry sweep settled the job first and reported it.
            Ok(result.rows_affected() > 0)
        }
    }

    async fn reap_expired(&self, queue: &str) -> Result<Vec<QueuedJob>> {
        Ok(self.requeue_expired(Some(queue)).await?.exhausted)
    }

    async fn wait_for_work(&self, _queue: &str, poll: Duration) {
        tokio::time::sleep(poll).await;
    }
}

/// Durable queue on the `run_jobs` table. Claims use `FOR UPDATE SKIP
/// LOCKED`, so any number of processes may attach workers to one queue.
#[derive(Clone, Debug)]
pub struct PostgresJobQueue {
    source: Arc<PgJobSource>,
    workers: Arc<WorkerSet>,
    poll_interval: Duration,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self::with_poll_interval(pool, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            source: Arc::new(PgJobSource { pool }),
            workers: Arc::new(WorkerSet::new()),
            poll_interval,
        }
    }

    /// Sweeps expired leases on every queue. Exhausted jobs are returned so
    /// the caller can record them as failed outcomes.
    pub async fn scan_expired_jobs(&self) -> Result<ExpiredJobs> {
        self.source.requeue_expired(None).await
    }

    pub async fn worker_batch_size(&self, queue: &str) -> Option<usize> {
        self.workers.batch_size(queue).await
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn create_queue(&self, name: &str) -> Result<()> {
        sqlx::query("INSERT INTO run_queues (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.source.pool)
            .await
            .map_err(|e| OrchestratorError::Queue(format!("create queue {name} failed: {e}")))?;
        Ok(())
    }

    async fn register_worker(
        &self,
        queue: &str,
        batch_size: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        self.source.queue_exists(queue).await?;
        self.workers
            .start(
                Arc::clone(&self.source),
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
        self.source.queue_exists(queue).await?;
        let SendRequest { payload, options } = request;
        let run_id = payload.run_id().map(|id| id.as_uuid());
        let job_type = payload.job_type();
        let payload = serde_json::to_value(&payload)?;

        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO run_jobs (
                id, queue_name, run_id, job_type, payload,
                retry_limit, retry_delay_secs, retry_backoff, expire_in_secs, singleton_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (queue_name, singleton_key)
                WHERE singleton_key IS NOT NULL AND state IN ('ready', 'active')
                DO NOTHING
            RETURNING id
            "#,
        )
        .bind(JobId::new().0)
        .bind(queue)
        .bind(run_id)
        .bind(job_type.as_str())
        .bind(payload)
        .bind(db_i32(options.retry_limit, "retry limit")?)
        .bind(db_i64(options.retry_delay_secs, "retry delay")?)
        .bind(options.retry_backoff)
        .bind(db_i64(options.expire_in_secs.max(1), "expiry")?)
        .bind(options.singleton_key.as_deref())
        .fetch_optional(&self.source.pool)
        .await
        .map_err(|e| OrchestratorError::Queue(format!("enqueue on {queue} failed: {e}")))?;

        Ok(id.map(JobId))
    }

    async fn shutdown(&self) {
        self.workers.stop_all().await;
    }

    async fn occupancy(&self, queue: &str) -> Result<QueueOccupancy> {
        self.source.queue_exists(queue).await?;
        let row = sqlx::query_as::<_, OccupancyRow>(
            r#"
            SELECT COUNT(*) FILTER (WHERE state = 'active') AS active,
                   COUNT(*) FILTER (WHERE state = 'ready') AS queued
            FROM run_jobs
            WHERE queue_name = $1 AND state IN ('ready', 'active')
            "#,
        )
        .bind(queue)
        .fetch_one(&self.source.pool)
        .await?;
        Ok(row.into())
    }

    async fn run_occupancy(&self, run_id: RunId) -> Result<QueueOccupancy> {
        let row = sqlx::query_as::<_, OccupancyRow>(
            r#"
            SELECT COUNT(*) FILTER (WHERE state = 'active') AS active,
                   COUNT(*) FILTER (WHERE state = 'ready') AS queued
            FROM run_jobs
            WHERE run_id = $1 AND state IN ('ready', 'active')
            "#,
        )
        .bind(run_id.as_uuid())
        .fetch_one(&self.source.pool)
        .await?;
        Ok(row.into())
    }
}
