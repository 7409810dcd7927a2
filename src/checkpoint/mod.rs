//! Schema-free checkpoint model and storage contract.
//!
//! A checkpoint is a per-job JSON document recording the exact position a
//! job can resume from. Fields are job-defined; the only fixed part of the
//! shape is the `recovery_mode` marker. Typed accessors ([`NestedCursor`])
//! are layered over the map so call sites stay type-safe while the store
//! stays schema-free.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryCheckpointStore;
pub use postgres::PgCheckpointStore;

const RECOVERY_MODE_KEY: &str = "recovery_mode";
const STAGE_KEY: &str = "stage";

/// Open-ended, job-type-specific checkpoint document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointData(Map<String, Value>);

impl CheckpointData {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Whether this checkpoint marks an interrupted run that must resume
    /// from its stored cursor rather than start fresh.
    pub fn recovery_mode(&self) -> bool {
        self.0
            .get(RECOVERY_MODE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_recovery_mode(&mut self, on: bool) {
        self.0.insert(RECOVERY_MODE_KEY.to_string(), Value::Bool(on));
    }

    /// Last stage the job was working in when this checkpoint was written.
    pub fn stage(&self) -> Option<&str> {
        self.get_str(STAGE_KEY)
    }

    pub fn set_stage(&mut self, stage: &crate::models::message::Stage) {
        self.0
            .insert(STAGE_KEY.to_string(), Value::String(stage.to_string()));
    }

    /// Shallow merge: fields in `other` overwrite same-named fields here,
    /// everything else is preserved. This is what lets one stage update its
    /// own cursor fields without clobbering another stage's.
    pub fn merge(&mut self, other: &CheckpointData) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn cursor(&self) -> NestedCursor {
        NestedCursor {
            outer: self.get_u64("outer").unwrap_or(0),
            inner: self.get_u64("inner").unwrap_or(0),
            inner_inner: self.get_u64("inner_inner"),
        }
    }

    pub fn set_cursor(&mut self, cursor: &NestedCursor) {
        self.set("outer", Value::from(cursor.outer));
        self.set("inner", Value::from(cursor.inner));
        match cursor.inner_inner {
            Some(v) => self.set("inner_inner", Value::from(v)),
            None => {
                self.0.remove("inner_inner");
            }
        }
    }
}

/// Typed multi-level pagination cursor: outer entity (e.g. repository),
/// inner entity (e.g. pull request), optional third level (e.g. comment
/// page). Interruption at any depth resumes from here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedCursor {
    pub outer: u64,
    pub inner: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_inner: Option<u64>,
}

impl NestedCursor {
    pub fn start() -> Self {
        Self::default()
    }
}

/// Pure storage abstraction for per-job checkpoint blobs.
///
/// `save` has merge semantics. A failed save is fatal to the current batch:
/// the caller must not ack queue messages whose checkpoint did not persist.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Merge `data` into the stored checkpoint for `job_name`, creating it
    /// if absent.
    async fn save(&self, job_name: &str, data: &CheckpointData) -> Result<(), StoreError>;

    /// Load the stored checkpoint, if any.
    async fn load(&self, job_name: &str) -> Result<Option<CheckpointData>, StoreError>;

    /// Remove the stored checkpoint. Called only after the final stage
    /// completes without error.
    async fn clear(&self, job_name: &str) -> Result<(), StoreError>;
}
