//! Postgres-backed checkpoint store.
//!
//! The checkpoint lives in a jsonb column on the job row. Merge semantics
//! use the jsonb `||` operator so a stage can update only its own cursor
//! fields without clobbering fields written by another stage.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::error::StoreError;

use super::{CheckpointData, CheckpointStore};

pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn save(&self, job_name: &str, data: &CheckpointData) -> Result<(), StoreError> {
        let patch = serde_json::to_value(data)?;
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET checkpoint_data = COALESCE(checkpoint_data, '{}'::jsonb) || $2,
                updated_at = NOW()
            WHERE name = $1
            "#,
        )
        .bind(job_name)
        .bind(patch)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownJob(job_name.to_string()));
        }
        Ok(())
    }

    async fn load(&self, job_name: &str) -> Result<Option<CheckpointData>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT checkpoint_data
            FROM sync_jobs
            WHERE name = $1
            "#,
        )
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .and_then(|r| r.try_get::<Option<serde_json::Value>, _>("checkpoint_data").ok())
            .flatten()
            .and_then(CheckpointData::from_value))
    }

    async fn clear(&self, job_name: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET checkpoint_data = NULL,
                updated_at = NOW()
            WHERE name = $1
            "#,
        )
        .bind(job_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
