use std::future::Future;

use crate::error::EgressResult;
use crate::types::{DestinationType, Job, JobStatus, JournalEntry, JournalOpType};

/// Operations the batch router needs from the durable job queue.
///
/// Job selection is per destination-type set and source; an empty
/// `destination_types` slice matches all types. The journal operations back
/// crash recovery: an entry is created before an upload attempt and deleted
/// after its terminal resolution.
pub trait JobQueue: Clone + Send + Sync + 'static {
    /// Jobs whose last attempt failed, oldest first.
    fn jobs_to_retry(
        &self,
        destination_types: &[DestinationType],
        limit: usize,
        source_id: &str,
    ) -> impl Future<Output = EgressResult<Vec<Job>>> + Send;

    /// Jobs parked in the waiting state.
    fn waiting_jobs(
        &self,
        destination_types: &[DestinationType],
        limit: usize,
        source_id: &str,
    ) -> impl Future<Output = EgressResult<Vec<Job>>> + Send;

    /// Jobs that never received a status.
    fn unprocessed_jobs(
        &self,
        destination_types: &[DestinationType],
        limit: usize,
        source_id: &str,
    ) -> impl Future<Output = EgressResult<Vec<Job>>> + Send;

    /// Jobs currently marked executing, across all sources.
    fn executing_jobs(
        &self,
        destination_types: &[DestinationType],
        limit: usize,
    ) -> impl Future<Output = EgressResult<Vec<Job>>> + Send;

    /// Writes a batch of job statuses.
    fn update_job_statuses(
        &self,
        statuses: Vec<JobStatus>,
        destination_types: &[DestinationType],
        source_id: Option<&str>,
    ) -> impl Future<Output = EgressResult<()>> + Send;

    /// Opens a journal entry for an operation about to start and returns its
    /// id.
    fn journal_mark_start(
        &self,
        op_type: JournalOpType,
        payload: serde_json::Value,
    ) -> impl Future<Output = EgressResult<i64>> + Send;

    /// Deletes a journal entry after the operation resolved.
    fn journal_delete(&self, op_id: i64) -> impl Future<Output = EgressResult<()>> + Send;

    /// Returns all open journal entries of a type.
    fn journal_entries(
        &self,
        op_type: JournalOpType,
    ) -> impl Future<Output = EgressResult<Vec<JournalEntry>>> + Send;
}
