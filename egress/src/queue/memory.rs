use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::EgressResult;
use crate::queue::JobQueue;
use crate::types::{DestinationType, Job, JobState, JobStatus, JournalEntry, JournalOpType};

#[derive(Debug, Clone)]
struct StoredJob {
    id: i64,
    source_id: String,
    destination_type: DestinationType,
    payload: serde_json::Value,
    attempt: i32,
    /// `None` until the first status write.
    state: Option<JobState>,
    error_response: serde_json::Value,
}

impl StoredJob {
    fn matches(&self, destination_types: &[DestinationType], source_id: Option<&str>) -> bool {
        let type_matches =
            destination_types.is_empty() || destination_types.contains(&self.destination_type);
        let source_matches = source_id.is_none_or(|source_id| self.source_id == source_id);
        type_matches && source_matches
    }

    fn as_job(&self) -> Job {
        Job {
            id: self.id,
            payload: self.payload.clone(),
            attempt: self.attempt,
        }
    }
}

#[derive(Debug)]
struct Inner {
    jobs: BTreeMap<i64, StoredJob>,
    next_job_id: i64,
    journal: BTreeMap<i64, (JournalOpType, serde_json::Value)>,
    next_op_id: i64,
}

/// In-memory job queue for development and tests.
///
/// Holds jobs and journal entries in process memory with the same selection
/// semantics the durable queue offers the router.
#[derive(Debug, Clone)]
pub struct MemoryJobQueue {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                jobs: BTreeMap::new(),
                next_job_id: 1,
                journal: BTreeMap::new(),
                next_op_id: 1,
            })),
        }
    }

    /// Adds a job that has never been processed and returns its id.
    pub fn push_unprocessed(
        &self,
        source_id: &str,
        destination_type: DestinationType,
        payload: serde_json::Value,
    ) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_job_id;
        inner.next_job_id += 1;
        inner.jobs.insert(
            id,
            StoredJob {
                id,
                source_id: source_id.to_owned(),
                destination_type,
                payload,
                attempt: 0,
                state: None,
                error_response: serde_json::json!({}),
            },
        );
        id
    }

    /// Forces a job into a state, simulating history from before a restart.
    pub fn force_state(&self, job_id: i64, state: JobState) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.state = Some(state);
        }
    }

    /// Ids of jobs currently in `state`.
    pub fn jobs_in_state(&self, state: JobState) -> Vec<i64> {
        let inner = self.inner.lock().unwrap();
        inner
            .jobs
            .values()
            .filter(|job| job.state == Some(state))
            .map(|job| job.id)
            .collect()
    }

    /// The last error response written for a job.
    pub fn error_response(&self, job_id: i64) -> Option<serde_json::Value> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(&job_id).map(|job| job.error_response.clone())
    }

    /// Number of open journal entries.
    pub fn journal_len(&self) -> usize {
        self.inner.lock().unwrap().journal.len()
    }

    fn select(
        &self,
        destination_types: &[DestinationType],
        limit: usize,
        source_id: Option<&str>,
        state: Option<JobState>,
    ) -> Vec<Job> {
        let inner = self.inner.lock().unwrap();
        inner
            .jobs
            .values()
            .filter(|job| job.state == state && job.matches(destination_types, source_id))
            .take(limit)
            .map(StoredJob::as_job)
            .collect()
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for MemoryJobQueue {
    async fn jobs_to_retry(
        &self,
        destination_types: &[DestinationType],
        limit: usize,
        source_id: &str,
    ) -> EgressResult<Vec<Job>> {
        Ok(self.select(destination_types, limit, Some(source_id), Some(JobState::Failed)))
    }

    async fn waiting_jobs(
        &self,
        destination_types: &[DestinationType],
        limit: usize,
        source_id: &str,
    ) -> EgressResult<Vec<Job>> {
        Ok(self.select(destination_types, limit, Some(source_id), Some(JobState::Waiting)))
    }

    async fn unprocessed_jobs(
        &self,
        destination_types: &[DestinationType],
        limit: usize,
        source_id: &str,
    ) -> EgressResult<Vec<Job>> {
        Ok(self.select(destination_types, limit, Some(source_id), None))
    }

    async fn executing_jobs(
        &self,
        destination_types: &[DestinationType],
        limit: usize,
    ) -> EgressResult<Vec<Job>> {
        Ok(self.select(destination_types, limit, None, Some(JobState::Executing)))
    }

    async fn update_job_statuses(
        &self,
        statuses: Vec<JobStatus>,
        _destination_types: &[DestinationType],
        _source_id: Option<&str>,
    ) -> EgressResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for status in statuses {
            if let Some(job) = inner.jobs.get_mut(&status.job_id) {
                job.state = Some(status.state);
                job.attempt = status.attempt;
                job.error_response = status.error_response;
            }
        }
        Ok(())
    }

    async fn journal_mark_start(
        &self,
        op_type: JournalOpType,
        payload: serde_json::Value,
    ) -> EgressResult<i64> {
        let mut inner = self.inner.lock().unwrap();
        let op_id = inner.next_op_id;
        inner.next_op_id += 1;
        inner.journal.insert(op_id, (op_type, payload));
        Ok(op_id)
    }

    async fn journal_delete(&self, op_id: i64) -> EgressResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.journal.remove(&op_id);
        Ok(())
    }

    async fn journal_entries(&self, op_type: JournalOpType) -> EgressResult<Vec<JournalEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .journal
            .iter()
            .filter(|(_, (entry_type, _))| *entry_type == op_type)
            .map(|(id, (_, payload))| JournalEntry {
                id: *id,
                payload: payload.clone(),
            })
            .collect())
    }
}
