//! In-memory job store for tests and embedded use.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::models::job::{Job, JobStatus};

use super::JobStore;

#[derive(Default)]
pub struct MemoryJobStore {
    // Vec keeps configured order, which list() must preserve.
    jobs: RwLock<Vec<Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_job<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Job) -> T,
    ) -> Result<T, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.name == name)
            .ok_or_else(|| StoreError::UnknownJob(name.to_string()))?;
        Ok(f(job))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.jobs.read().await.clone())
    }

    async fn get(&self, name: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.iter().find(|j| j.name == name).cloned())
    }

    async fn upsert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.iter_mut().find(|j| j.name == job.name) {
            Some(existing) => existing.active = job.active,
            None => jobs.push(job.clone()),
        }
        Ok(())
    }

    async fn update_status(&self, name: &str, status: JobStatus) -> Result<(), StoreError> {
        self.with_job(name, |job| job.status = status).await
    }

    async fn mark_run_started(&self, name: &str) -> Result<(), StoreError> {
        self.with_job(name, |job| {
            job.status = JobStatus::Running;
            job.last_run_started_at = Some(Utc::now());
        })
        .await
    }

    async fn mark_finished(&self, name: &str, alert: Option<&str>) -> Result<(), StoreError> {
        self.with_job(name, |job| {
            job.status = JobStatus::Finished;
            match alert {
                Some(alert) => job.error_message = Some(alert.to_string()),
                None => {
                    job.last_success_at = Some(Utc::now());
                    job.retry_count = 0;
                    job.error_message = None;
                }
            }
        })
        .await
    }

    async fn mark_failed(&self, name: &str, error: &str) -> Result<i32, StoreError> {
        self.with_job(name, |job| {
            job.status = JobStatus::Failed;
            job.retry_count += 1;
            job.error_message = Some(error.to_string());
            job.retry_count
        })
        .await
    }

    async fn set_active(&self, name: &str, active: bool) -> Result<(), StoreError> {
        self.with_job(name, |job| job.active = active).await
    }
}
