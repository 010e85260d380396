use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Type, prelude::FromRow};

/// Lifecycle state of a staging file in the warehouse pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(type_name = "wh_staging_file_state_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StagingFileStatus {
    Waiting,
    Executing,
    Succeeded,
    Failed,
}

/// Persistent state of a warehouse upload.
///
/// States advance `generating_load_file → generated_load_file →
/// updating_schema → updated_schema → exporting_data → exported_data`, each
/// stage paired with a `_failed` state. `exported_data` and `aborted` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(type_name = "wh_upload_state_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    GeneratingLoadFile,
    GeneratingLoadFileFailed,
    GeneratedLoadFile,
    UpdatingSchema,
    UpdatingSchemaFailed,
    UpdatedSchema,
    ExportingData,
    ExportingDataFailed,
    ExportedData,
    Aborted,
}

impl UploadStatus {
    /// Returns whether this state ends the upload's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::ExportedData | UploadStatus::Aborted)
    }

    /// Returns whether an upload in this state still needs its load files
    /// generated before the warehouse flow can run.
    pub fn needs_load_files(&self) -> bool {
        matches!(
            self,
            UploadStatus::GeneratingLoadFile | UploadStatus::GeneratingLoadFileFailed
        )
    }

    /// Returns whether an upload in this state can skip schema migration and
    /// go straight to export on resume.
    pub fn ready_for_export(&self) -> bool {
        matches!(
            self,
            UploadStatus::UpdatedSchema
                | UploadStatus::ExportingData
                | UploadStatus::ExportingDataFailed
        )
    }
}

/// Configurable names for the catalog tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct CatalogTables {
    pub staging_files: String,
    pub load_files: String,
    pub uploads: String,
    pub schemas: String,
}

impl Default for CatalogTables {
    fn default() -> Self {
        Self {
            staging_files: "wh_staging_files".to_owned(),
            load_files: "wh_load_files".to_owned(),
            uploads: "wh_uploads".to_owned(),
            schemas: "wh_schemas".to_owned(),
        }
    }
}

/// Row of the staging-files table: one gzipped raw batch uploaded into the
/// warehouse staging area.
#[derive(Debug, Clone, FromRow)]
pub struct StagingFileRow {
    pub id: i64,
    pub location: String,
    pub source_id: String,
    pub destination_id: String,
    pub schema: serde_json::Value,
    pub status: StagingFileStatus,
    pub created_at: DateTime<Utc>,
}

/// Staging-file record as inserted by the batch router.
#[derive(Debug, Clone)]
pub struct NewStagingFile {
    pub location: String,
    pub source_id: String,
    pub destination_id: String,
    pub schema: serde_json::Value,
}

/// Row of the uploads table: one run of the warehouse pipeline over a
/// contiguous range of staging files.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub id: i64,
    pub source_id: String,
    pub namespace: String,
    pub destination_id: String,
    pub destination_type: String,
    pub start_staging_file_id: i64,
    pub end_staging_file_id: i64,
    pub start_load_file_id: i64,
    pub end_load_file_id: i64,
    pub status: UploadStatus,
    pub schema: serde_json::Value,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRow {
    /// Number of failure transitions recorded on this upload.
    pub fn error_attempts(&self) -> i64 {
        self.error
            .as_ref()
            .and_then(|error| error.get("attempts"))
            .and_then(|attempts| attempts.as_i64())
            .unwrap_or(0)
    }
}

/// Upload record as inserted by the warehouse main loop.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub source_id: String,
    pub namespace: String,
    pub destination_id: String,
    pub destination_type: String,
    pub start_staging_file_id: i64,
    pub end_staging_file_id: i64,
    pub start_load_file_id: i64,
    pub schema: serde_json::Value,
}

/// Row of the load-files table: one per-table load file emitted from a
/// staging file.
#[derive(Debug, Clone, FromRow)]
pub struct LoadFileRow {
    pub id: i64,
    pub staging_file_id: i64,
    pub source_id: String,
    pub destination_id: String,
    pub destination_type: String,
    pub table_name: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

/// Load-file record as inserted by the load-file builders.
#[derive(Debug, Clone)]
pub struct NewLoadFile {
    pub staging_file_id: i64,
    pub source_id: String,
    pub destination_id: String,
    pub destination_type: String,
    pub table_name: String,
    pub location: String,
}

/// Row of the schemas table. The latest row per (source, destination) is the
/// current schema of the destination.
#[derive(Debug, Clone, FromRow)]
pub struct SchemaRow {
    pub id: i64,
    pub wh_upload_id: i64,
    pub source_id: String,
    pub namespace: String,
    pub destination_id: String,
    pub destination_type: String,
    pub schema: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Schema record as persisted after a successful schema migration.
#[derive(Debug, Clone)]
pub struct NewSchema {
    pub wh_upload_id: i64,
    pub source_id: String,
    pub namespace: String,
    pub destination_id: String,
    pub destination_type: String,
    pub schema: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_status_terminality() {
        assert!(UploadStatus::ExportedData.is_terminal());
        assert!(UploadStatus::Aborted.is_terminal());
        assert!(!UploadStatus::ExportingDataFailed.is_terminal());
        assert!(!UploadStatus::GeneratingLoadFile.is_terminal());
    }

    #[test]
    fn upload_status_resume_classification() {
        assert!(UploadStatus::GeneratingLoadFile.needs_load_files());
        assert!(UploadStatus::GeneratingLoadFileFailed.needs_load_files());
        assert!(!UploadStatus::GeneratedLoadFile.needs_load_files());

        assert!(UploadStatus::UpdatedSchema.ready_for_export());
        assert!(UploadStatus::ExportingData.ready_for_export());
        assert!(UploadStatus::ExportingDataFailed.ready_for_export());
        assert!(!UploadStatus::UpdatingSchemaFailed.ready_for_export());
    }

    #[test]
    fn upload_status_serializes_snake_case() {
        let json = serde_json::to_value(UploadStatus::GeneratingLoadFile).unwrap();
        assert_eq!(json, serde_json::json!("generating_load_file"));

        let status: UploadStatus = serde_json::from_value(serde_json::json!("exported_data")).unwrap();
        assert_eq!(status, UploadStatus::ExportedData);
    }

    #[test]
    fn error_attempts_defaults_to_zero() {
        let mut row = UploadRow {
            id: 1,
            source_id: "s".into(),
            namespace: "ns".into(),
            destination_id: "d".into(),
            destination_type: "RS".into(),
            start_staging_file_id: 1,
            end_staging_file_id: 2,
            start_load_file_id: 0,
            end_load_file_id: 0,
            status: UploadStatus::GeneratingLoadFile,
            schema: serde_json::json!({}),
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(row.error_attempts(), 0);

        row.error = Some(serde_json::json!({"message": "copy failed", "attempts": 3}));
        assert_eq!(row.error_attempts(), 3);
    }
}
