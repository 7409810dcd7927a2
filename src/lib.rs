//! ETL Job Orchestration & Checkpoint-Recovery Engine
//!
//! This library schedules a fixed set of long-running data-synchronization
//! jobs (a GitHub sync, a Jira sync, ...) through a four-stage pipeline
//! (extract → transform → load → vectorize) and guarantees that any
//! interruption — crash, rate limit, network failure — resumes from a
//! persisted checkpoint without data loss or duplication.

pub mod app_state;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod routes;
pub mod scheduler;
