use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{from_db_count, to_db_count};
use crate::error::{OrchestratorError, Result};
use crate::persistence::{IncrementOutcome, RunStore};
use crate::types::{
    ProbeOutcome, ProbeUnit, ProgressDelta, ProgressState, Run, RunId, RunProgress, RunStatus,
    SummaryOutcome,
};

const RUN_COLUMNS: &str = "id, status, progress_total, progress_completed, progress_failed, \
     summarize_total, summarize_completed, summarize_failed, \
     created_at, started_at, completed_at, updated_at";

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    status: String,
    progress_total: i32,
    progress_completed: i32,
    progress_failed: i32,
    summarize_total: Option<i32>,
    summarize_completed: Option<i32>,
    summarize_failed: Option<i32>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let status = self.status.parse::<RunStatus>().map_err(|e| {
            OrchestratorError::Internal(format!("run {} has unreadable status: {e}", self.id))
        })?;
        let summarize_progress = self.summarize_total.map(|total| RunProgress {
            total: from_db_count(total),
            completed: from_db_count(self.summarize_completed.unwrap_or(0)),
            failed: from_db_count(self.summarize_failed.unwrap_or(0)),
        });
        Ok(Run {
            id: RunId(self.id),
            status,
            progress: RunProgress {
                total: from_db_count(self.progress_total),
                completed: from_db_count(self.progress_completed),
                failed: from_db_count(self.progress_failed),
            },
            summarize_progress,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UnitRow {
    provider: String,
    model_id: String,
    scenario_id: String,
}

impl From<UnitRow> for ProbeUnit {
    fn from(row: UnitRow) -> Self {
        ProbeUnit::new(row.provider, row.model_id, row.scenario_id)
    }
}

#[derive(sqlx::FromRow)]
struct UnitOutcomeRow {
    probe_outcome: Option<String>,
    summary_outcome: Option<String>,
}

fn not_found(run_id: RunId) -> OrchestratorError {
    OrchestratorError::NotFound(format!("run {run_id}"))
}

/// Run bookkeeping in PostgreSQL. Counter updates are single conditional
/// statements; every write that also touches unit outcomes holds the run row
/// lock for the length of one short transaction.
#[derive(Clone, Debug)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Moves `updated_at` into the past, as if the run had been idle.
    pub async fn set_updated_at(&self, run_id: RunId, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE runs SET updated_at = $2 WHERE id = $1")
            .bind(run_id.as_uuid())
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(not_found(run_id));
        }
        Ok(())
    }

    async fn lock_run(tx: &mut Transaction<'_, Postgres>, run_id: RunId) -> Result<Run> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = $1 FOR UPDATE"
        ))
        .bind(run_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?;
        row.ok_or_else(|| not_found(run_id))?.into_run()
    }

    async fn lock_unit(
        tx: &mut Transaction<'_, Postgres>,
        run_id: RunId,
        unit: &ProbeUnit,
    ) -> Result<UnitOutcomeRow> {
        sqlx::query_as::<_, UnitOutcomeRow>(
            r#"
            SELECT probe_outcome, summary_outcome
            FROM run_units
            WHERE run_id = $1 AND provider = $2 AND model_id = $3 AND scenario_id = $4
            FOR UPDATE
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(&unit.provider)
        .bind(&unit.model_id)
        .bind(&unit.scenario_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("unit {unit} in run {run_id}")))
    }

    async fn ensure_exists(&self, run_id: RunId) -> Result<()> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM runs WHERE id = $1)")
            .bind(run_id.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        if exists { Ok(()) } else { Err(not_found(run_id)) }
    }

    async fn units_where(&self, run_id: RunId, filter: &str) -> Result<Vec<ProbeUnit>> {
        let rows = sqlx::query_as::<_, UnitRow>(&format!(
            "SELECT provider, model_id, scenario_id FROM run_units \
             WHERE run_id = $1 AND {filter} \
             ORDER BY provider, model_id, scenario_id"
        ))
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            self.ensure_exists(run_id).await?;
        }
        Ok(rows.into_iter().map(ProbeUnit::from).collect())
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn create_run(&self, units: Vec<ProbeUnit>) -> Result<Run> {
        let units: BTreeSet<ProbeUnit> = units.into_iter().collect();
        let total = u32::try_from(units.len())
            .map_err(|_| OrchestratorError::Internal("run has too many units".into()))?;
        let run = Run::new(total);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO runs (id, status, progress_total, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.status.as_str())
        .bind(to_db_count(total)?)
        .bind(run.created_at)
        .execute(&mut *tx)
        .await?;

        let mut providers = Vec::with_capacity(units.len());
        let mut models = Vec::with_capacity(units.len());
        let mut scenarios = Vec::with_capacity(units.len());
        for unit in units {
            providers.push(unit.provider);
            models.push(unit.model_id);
            scenarios.push(unit.scenario_id);
        }
        sqlx::query(
            r#"
            INSERT INTO run_units (run_id, provider, model_id, scenario_id)
            SELECT $1, * FROM UNNEST($2::text[], $3::text[], $4::text[])
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(&providers)
        .bind(&models)
        .bind(&scenarios)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(run)
    }

    async fn read_run(&self, run_id: RunId) -> Result<Run> {
        sqlx::query_as::<_, RunRow>(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
            .bind(run_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| not_found(run_id))?
            .into_run()
    }

    async fn list_runs(&self, statuses: &[RunStatus]) -> Result<Vec<Run>> {
        let statuses: Vec<&str> = statuses.iter().map(RunStatus::as_str).collect();
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status = ANY($1) ORDER BY created_at"
        ))
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    async fn conditional_increment(
        &self,
        run_id: RunId,
        delta: ProgressDelta,
    ) -> Result<IncrementOutcome> {
        if !delta.is_empty() {
            let completed = to_db_count(delta.completed)?;
            let failed = to_db_count(delta.failed)?;
            let mut tx = self.pool.begin().await?;
            let row = sqlx::query_as::<_, RunRow>(&format!(
                "UPDATE runs \
                 SET progress_completed = progress_completed + $2, \
                     progress_failed = progress_failed + $3, \
                     updated_at = NOW() \
                 WHERE id = $1 \
                   AND status IN ('PENDING', 'RUNNING') \
                   AND progress_completed + progress_failed + $2 + $3 <= progress_total \
                 RETURNING {RUN_COLUMNS}"
            ))
            .bind(run_id.as_uuid())
            .bind(completed)
            .bind(failed)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = row {
                // The run row lock taken above serializes this with every
                // other outcome write for the run.
                sqlx::query(
                    r#"
                    UPDATE run_units u
                    SET probe_outcome = CASE WHEN claimed.n <= $2 THEN 'succeeded' ELSE 'failed' END,
                        updated_at = NOW()
                    FROM (
                        SELECT provider, model_id, scenario_id,
                               ROW_NUMBER() OVER (ORDER BY provider, model_id, scenario_id) AS n
                        FROM run_units
                        WHERE run_id = $1 AND probe_outcome IS NULL
                        ORDER BY provider, model_id, scenario_id
                        LIMIT $2 + $3
                    ) claimed
                    WHERE u.run_id = $1
                      AND u.provider = claimed.provider
                      AND u.model_id = claimed.model_id
                      AND u.scenario_id = claimed.scenario_id
                    "#,
                )
                .bind(run_id.as_uuid())
                .bind(completed)
                .bind(failed)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                return Ok(IncrementOutcome {
                    applied: true,
                    state: row.into_run()?.state(),
                });
            }
            tx.rollback().await?;
        }
        let run = self.read_run(run_id).await?;
        Ok(IncrementOutcome {
            applied: false,
            state: run.state(),
        })
    }

    async fn conditional_increment_summarize(
        &self,
        run_id: RunId,
        delta: ProgressDelta,
    ) -> Result<IncrementOutcome> {
        if !delta.is_empty() {
            let row = sqlx::query_as::<_, RunRow>(&format!(
                "UPDATE runs \
                 SET summarize_completed = COALESCE(summarize_completed, 0) + $2, \
                     summarize_failed = COALESCE(summarize_failed, 0) + $3, \
                     updated_at = NOW() \
                 WHERE id = $1 \
                   AND status = 'SUMMARIZING' \
                   AND summarize_total IS NOT NULL \
                   AND COALESCE(summarize_completed, 0) + COALESCE(summarize_failed, 0) + $2 + $3 \
                       <= summarize_total \
                 RETURNING {RUN_COLUMNS}"
            ))
            .bind(run_id.as_uuid())
            .bind(to_db_count(delta.completed)?)
            .bind(to_db_count(delta.failed)?)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                let run = row.into_run()?;
                return Ok(IncrementOutcome {
                    applied: true,
                    state: ProgressState {
                        progress: run.summarize_progress.unwrap_or_default(),
                        status: run.status,
                    },
                });
            }
        }
        let run = self.read_run(run_id).await?;
        Ok(IncrementOutcome {
            applied: false,
            state: ProgressState {
                progress: run.summarize_progress.unwrap_or_default(),
                status: run.status,
            },
        })
    }

    async fn transition_status(
        &self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = $3,
                updated_at = NOW(),
                started_at = CASE
                    WHEN $3 = 'RUNNING' AND started_at IS NULL THEN NOW()
                    ELSE started_at
                END,
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(to.is_terminal())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.ensure_exists(run_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn init_summarize_progress(&self, run_id: RunId, total: u32) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET summarize_total = $2,
                summarize_completed = 0,
                summarize_failed = 0,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(to_db_count(total)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(not_found(run_id));
        }
        Ok(())
    }

    async fn pending_probe_units(&self, run_id: RunId) -> Result<Vec<ProbeUnit>> {
        self.units_where(run_id, "probe_outcome IS NULL").await
    }

    async fn record_probe_outcome(
        &self,
        run_id: RunId,
        unit: &ProbeUnit,
        outcome: ProbeOutcome,
    ) -> Result<IncrementOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut run = Self::lock_run(&mut tx, run_id).await?;
        let current = Self::lock_unit(&mut tx, run_id, unit).await?;

        let applied = current.probe_outcome.is_none()
            && run.status.accepts_probe_progress()
            && run.progress.try_apply(outcome.delta());
        if !applied {
            tx.rollback().await?;
            return Ok(IncrementOutcome {
                applied: false,
                state: run.state(),
            });
        }

        sqlx::query(
            r#"
            UPDATE run_units
            SET probe_outcome = $5, updated_at = NOW()
            WHERE run_id = $1 AND provider = $2 AND model_id = $3 AND scenario_id = $4
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(&unit.provider)
        .bind(&unit.model_id)
        .bind(&unit.scenario_id)
        .bind(outcome.as_str())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE runs
            SET progress_completed = $2, progress_failed = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(to_db_count(run.progress.completed)?)
        .bind(to_db_count(run.progress.failed)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(IncrementOutcome {
            applied: true,
            state: run.state(),
        })
    }

    async fn unsummarized_units(&self, run_id: RunId) -> Result<Vec<ProbeUnit>> {
        self.units_where(
            run_id,
            "probe_outcome = 'succeeded' AND summary_outcome IS NULL",
        )
        .await
    }

    async fn record_summary_outcome(
        &self,
        run_id: RunId,
        unit: &ProbeUnit,
        outcome: SummaryOutcome,
    ) -> Result<IncrementOutcome> {
        let mut tx = self.pool.begin().await?;
        let run = Self::lock_run(&mut tx, run_id).await?;
        let current = Self::lock_unit(&mut tx, run_id, unit).await?;

        let mut progress = run.summarize_progress.unwrap_or_default();
        let applied = current.probe_outcome.as_deref() == Some(ProbeOutcome::Succeeded.as_str())
            && current.summary_outcome.is_none()
            && run.status == RunStatus::Summarizing
            && progress.try_apply(outcome.delta());
        if !applied {
            tx.rollback().await?;
            return Ok(IncrementOutcome {
                applied: false,
                state: ProgressState {
                    progress,
                    status: run.status,
                },
            });
        }

        sqlx::query(
            r#"
            UPDATE run_units
            SET summary_outcome = $5, updated_at = NOW()
            WHERE run_id = $1 AND provider = $2 AND model_id = $3 AND scenario_id = $4
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(&unit.provider)
        .bind(&unit.model_id)
        .bind(&unit.scenario_id)
        .bind(outcome.as_str())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE runs
            SET summarize_total = $2,
                summarize_completed = $3,
                summarize_failed = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(to_db_count(progress.total)?)
        .bind(to_db_count(progress.completed)?)
        .bind(to_db_count(progress.failed)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(IncrementOutcome {
            applied: true,
            state: ProgressState {
                progress,
                status: run.status,
            },
        })
    }
}
