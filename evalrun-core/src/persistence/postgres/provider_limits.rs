use async_trait::async_trait;
use sqlx::PgPool;

use super::from_db_count;
use crate::error::Result;
use crate::orchestration::limits::ProviderLimitsSource;
use crate::types::ProviderLimits;

/// Reads limits from the `llm_providers` table.
#[derive(Clone, Debug)]
pub struct PostgresProviderLimits {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ProviderRow {
    name: String,
    max_parallel_requests: i32,
    requests_per_minute: i32,
}

impl PostgresProviderLimits {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts or updates one provider's limits.
    pub async fn upsert(&self, limits: &ProviderLimits) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO llm_providers (name, max_parallel_requests, requests_per_minute)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET max_parallel_requests = EXCLUDED.max_parallel_requests,
                requests_per_minute = EXCLUDED.requests_per_minute,
                updated_at = NOW()
            "#,
        )
        .bind(&limits.provider_name)
        .bind(super::to_db_count(limits.max_parallel_requests)?)
        .bind(super::to_db_count(limits.requests_per_minute)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProviderLimitsSource for PostgresProviderLimits {
    async fn load_all(&self) -> Result<Vec<ProviderLimits>> {
        let rows = sqlx::query_as::<_, ProviderRow>(
            r#"
            SELECT name, max_parallel_requests, requests_per_minute
            FROM llm_providers
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                ProviderLimits::new(
                    row.name,
                    from_db_count(row.max_parallel_requests),
                    from_db_count(row.requests_per_minute),
                )
            })
            .collect())
    }
}
