use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use roost_core::error::AppError;
use roost_core::job::{JobStatus, ScrapeJob};
use roost_core::models::Source;
use roost_core::traits::JobStore;

/// PostgreSQL-backed record of scrape job state.
///
/// The orchestrator owns scheduling; this table is its durable journal,
/// read back by `recover()` after a restart.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// List jobs, newest first, optionally filtered by source and status.
    pub async fn list_jobs(
        &self,
        source: Option<Source>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<ScrapeJob>, AppError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT data FROM scrape_jobs
            WHERE ($1::VARCHAR IS NULL OR source = $1)
              AND ($2::VARCHAR IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(source.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM scrape_jobs WHERE status = $1"#)
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count)
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct JobRow {
    data: serde_json::Value,
}

impl JobRow {
    fn into_job(self) -> Result<ScrapeJob, AppError> {
        Ok(serde_json::from_value(self.data)?)
    }
}

impl JobStore for PgJobRepository {
    async fn save_job(&self, job: &ScrapeJob) -> Result<(), AppError> {
        let data = serde_json::to_value(job)?;
        sqlx::query(
            r#"
            INSERT INTO scrape_jobs
                (id, batch_id, source, status, priority, attempts, max_attempts,
                 created_at, scheduled_for, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                priority = EXCLUDED.priority,
                attempts = EXCLUDED.attempts,
                max_attempts = EXCLUDED.max_attempts,
                scheduled_for = EXCLUDED.scheduled_for,
                data = EXCLUDED.data,
                updated_at = NOW()
            "#,
        )
        .bind(job.id)
        .bind(job.batch_id)
        .bind(job.source.as_str())
        .bind(job.status.as_str())
        .bind(job.priority.as_str())
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.created_at)
        .bind(job.scheduled_for)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ScrapeJob>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(r#"SELECT data FROM scrape_jobs WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(JobRow::into_job).transpose()
    }

    async fn list_unfinished(&self) -> Result<Vec<ScrapeJob>, AppError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT data FROM scrape_jobs
            WHERE status IN ('pending', 'processing')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(JobRow::into_job).collect()
    }
}
