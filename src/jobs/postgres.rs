//! Postgres-backed job store over the `sync_jobs` table.

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::error::StoreError;
use crate::models::job::{Job, JobStatus};

use super::JobStore;

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &PgRow) -> Result<Job, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Job {
            name: row.try_get("name")?,
            active: row.try_get("active")?,
            status: JobStatus::parse(&status),
            last_run_started_at: row.try_get("last_run_started_at")?,
            last_success_at: row.try_get("last_success_at")?,
            retry_count: row.try_get("retry_count")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

const JOB_COLUMNS: &str =
    "name, active, status, last_run_started_at, last_success_at, retry_count, error_message";

#[async_trait]
impl JobStore for PgJobStore {
    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs ORDER BY ordinal ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| Self::row_to_job(r).map_err(StoreError::Database))
            .collect()
    }

    async fn get(&self, name: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_job(&r).map_err(StoreError::Database))
            .transpose()
    }

    async fn upsert(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_jobs (name, active, status, ordinal)
            VALUES ($1, $2, 'not_started',
                    COALESCE((SELECT MAX(ordinal) + 1 FROM sync_jobs), 0))
            ON CONFLICT (name) DO UPDATE
            SET active = EXCLUDED.active,
                updated_at = NOW()
            "#,
        )
        .bind(&job.name)
        .bind(job.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_status(&self, name: &str, status: JobStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = $2, updated_at = NOW()
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownJob(name.to_string()));
        }
        Ok(())
    }

    async fn mark_run_started(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'running',
                last_run_started_at = NOW(),
                error_message = NULL,
                updated_at = NOW()
            WHERE name = $1
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_finished(&self, name: &str, alert: Option<&str>) -> Result<(), StoreError> {
        match alert {
            None => {
                sqlx::query(
                    r#"
                    UPDATE sync_jobs
                    SET status = 'finished',
                        last_success_at = NOW(),
                        retry_count = 0,
                        error_message = NULL,
                        updated_at = NOW()
                    WHERE name = $1
                    "#,
                )
                .bind(name)
                .execute(&self.pool)
                .await?;
            }
            Some(alert) => {
                sqlx::query(
                    r#"
                    UPDATE sync_jobs
                    SET status = 'finished',
                        error_message = $2,
                        updated_at = NOW()
                    WHERE name = $1
                    "#,
                )
                .bind(name)
                .bind(alert)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, name: &str, error: &str) -> Result<i32, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'failed',
                retry_count = retry_count + 1,
                error_message = $2,
                updated_at = NOW()
            WHERE name = $1
            RETURNING retry_count
            "#,
        )
        .bind(name)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("retry_count")?)
    }

    async fn set_active(&self, name: &str, active: bool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET active = $2, updated_at = NOW()
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
