//! Persistence contract for the job table.
//!
//! The orchestrator actor is the sole writer for a given job; the store just
//! mirrors status, timestamps, and retry bookkeeping so they survive
//! restarts and are visible to the admin surface.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::job::{Job, JobStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// All configured jobs, in configured order.
    async fn list(&self) -> Result<Vec<Job>, StoreError>;

    async fn get(&self, name: &str) -> Result<Option<Job>, StoreError>;

    /// Register a job at configuration load time. Existing rows keep their
    /// status and bookkeeping; only `active` is refreshed.
    async fn upsert(&self, job: &Job) -> Result<(), StoreError>;

    async fn update_status(&self, name: &str, status: JobStatus) -> Result<(), StoreError>;

    /// Transition to RUNNING and record `last_run_started_at`.
    async fn mark_run_started(&self, name: &str) -> Result<(), StoreError>;

    /// Transition to FINISHED. A clean finish (`alert == None`) records
    /// `last_success_at`, resets `retry_count`, and clears `error_message`;
    /// an alerted finish (e.g. integration deactivated) stores the alert.
    async fn mark_finished(&self, name: &str, alert: Option<&str>) -> Result<(), StoreError>;

    /// Transition to FAILED, store the error, increment and return
    /// `retry_count`.
    async fn mark_failed(&self, name: &str, error: &str) -> Result<i32, StoreError>;

    async fn set_active(&self, name: &str, active: bool) -> Result<(), StoreError>;
}
