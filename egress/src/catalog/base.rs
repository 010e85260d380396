use std::future::Future;

use egress_postgres::types::{
    NewLoadFile, NewSchema, NewStagingFile, NewUpload, SchemaRow, StagingFileRow,
    StagingFileStatus, UploadRow, UploadStatus,
};

use crate::error::EgressResult;

/// Persistence operations of the warehouse pipeline.
///
/// One non-terminal upload exists per `(source, destination)` at any time;
/// implementations must preserve that invariant through
/// [`WarehouseCatalog::create_upload`] and the status setters.
pub trait WarehouseCatalog: Clone + Send + Sync + 'static {
    /// Records a staging file uploaded by the batch router.
    fn insert_staging_file(
        &self,
        file: NewStagingFile,
    ) -> impl Future<Output = EgressResult<i64>> + Send;

    /// Sets the status of a set of staging files.
    fn set_staging_files_status(
        &self,
        ids: &[i64],
        status: StagingFileStatus,
    ) -> impl Future<Output = EgressResult<()>> + Send;

    /// Staging files with id strictly greater than `after_id`, ascending,
    /// up to `limit`.
    fn staging_files_after(
        &self,
        source_id: &str,
        destination_id: &str,
        after_id: i64,
        limit: i64,
    ) -> impl Future<Output = EgressResult<Vec<StagingFileRow>>> + Send;

    /// Staging files of an existing upload, by inclusive id range.
    fn staging_files_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> impl Future<Output = EgressResult<Vec<StagingFileRow>>> + Send;

    /// `end_staging_file_id` of the last terminal upload, or 0.
    fn last_exported_staging_file_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> impl Future<Output = EgressResult<i64>> + Send;

    /// `end_load_file_id` of the last terminal upload, or 0.
    fn last_exported_load_file_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> impl Future<Output = EgressResult<i64>> + Send;

    /// Inserts a new upload in `generating_load_file` state.
    fn create_upload(
        &self,
        upload: NewUpload,
    ) -> impl Future<Output = EgressResult<UploadRow>> + Send;

    /// The single non-terminal upload of a binding, if any.
    fn pending_upload(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> impl Future<Output = EgressResult<Option<UploadRow>>> + Send;

    /// Moves an upload into a new state.
    fn set_upload_status(
        &self,
        upload_id: i64,
        status: UploadStatus,
    ) -> impl Future<Output = EgressResult<()>> + Send;

    /// Moves an upload into a failed state, recording the error and bumping
    /// the attempt counter.
    fn set_upload_error(
        &self,
        upload_id: i64,
        status: UploadStatus,
        message: &str,
    ) -> impl Future<Output = EgressResult<()>> + Send;

    /// Records the end of load-file generation.
    fn set_upload_generated(
        &self,
        upload_id: i64,
        end_load_file_id: i64,
    ) -> impl Future<Output = EgressResult<()>> + Send;

    /// Records one emitted load file and returns its id.
    fn insert_load_file(
        &self,
        file: NewLoadFile,
    ) -> impl Future<Output = EgressResult<i64>> + Send;

    /// Highest load-file id for a binding, or 0.
    fn last_load_file_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> impl Future<Output = EgressResult<i64>> + Send;

    /// Object locations of a table's load files in the id range
    /// `(start_id, end_id]`.
    fn load_file_locations(
        &self,
        source_id: &str,
        destination_id: &str,
        table_name: &str,
        start_id: i64,
        end_id: i64,
    ) -> impl Future<Output = EgressResult<Vec<String>>> + Send;

    /// Latest schema row for a binding: the destination's current schema.
    fn current_schema(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> impl Future<Output = EgressResult<Option<SchemaRow>>> + Send;

    /// Appends a new current-schema row.
    fn save_current_schema(
        &self,
        schema: NewSchema,
    ) -> impl Future<Output = EgressResult<()>> + Send;
}
