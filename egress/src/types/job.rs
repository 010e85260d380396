use serde::{Deserialize, Serialize};

use crate::storage::StorageProvider;

/// A job handed out by the job queue: one event payload awaiting delivery.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    /// Opaque event payload. For warehouse-bound jobs this carries
    /// `metadata.table`, `metadata.columns` and `data`.
    pub payload: serde_json::Value,
    /// Attempt number of the last recorded status.
    pub attempt: i32,
}

impl Job {
    /// The event's `messageId`, used for crash-recovery deduplication.
    pub fn message_id(&self) -> Option<&str> {
        self.payload.get("messageId").and_then(|id| id.as_str())
    }
}

/// Delivery state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Executing,
    Succeeded,
    Failed,
    Aborted,
}

/// A status write for a job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: i64,
    pub attempt: i32,
    pub state: JobState,
    pub error_response: serde_json::Value,
}

impl JobStatus {
    /// Status marking a job as picked up for a new attempt.
    pub fn executing(job: &Job) -> Self {
        Self {
            job_id: job.id,
            attempt: job.attempt + 1,
            state: JobState::Executing,
            error_response: serde_json::json!({}),
        }
    }

    /// Terminal success status.
    pub fn succeeded(job: &Job) -> Self {
        Self {
            job_id: job.id,
            attempt: job.attempt,
            state: JobState::Succeeded,
            error_response: serde_json::json!({"success": "OK"}),
        }
    }

    /// Terminal failure status carrying the error message.
    pub fn failed(job: &Job, error: &str) -> Self {
        Self {
            job_id: job.id,
            attempt: job.attempt,
            state: JobState::Failed,
            error_response: serde_json::json!({"error": error}),
        }
    }
}

/// Journalled operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalOpType {
    RawUpload,
}

/// An open journal entry describing an in-flight operation.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub id: i64,
    pub payload: serde_json::Value,
}

/// Journal payload of a raw upload: enough to find the object again after a
/// crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageObject {
    pub provider: StorageProvider,
    pub bucket: String,
    pub key: String,
}
