use std::sync::{Arc, Mutex};

use chrono::Utc;

use egress_postgres::types::{
    LoadFileRow, NewLoadFile, NewSchema, NewStagingFile, NewUpload, SchemaRow, StagingFileRow,
    StagingFileStatus, UploadRow, UploadStatus,
};

use crate::catalog::WarehouseCatalog;
use crate::error::EgressResult;

#[derive(Debug, Default)]
struct Inner {
    staging_files: Vec<StagingFileRow>,
    uploads: Vec<UploadRow>,
    load_files: Vec<LoadFileRow>,
    schemas: Vec<SchemaRow>,
    next_staging_file_id: i64,
    next_upload_id: i64,
    next_load_file_id: i64,
    next_schema_id: i64,
}

/// In-memory warehouse catalog for development and tests.
#[derive(Debug, Clone)]
pub struct MemoryCatalog {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_staging_file_id: 1,
                next_upload_id: 1,
                next_load_file_id: 1,
                next_schema_id: 1,
                ..Default::default()
            })),
        }
    }

    /// Returns a copy of all upload rows, for inspection in tests.
    pub fn uploads(&self) -> Vec<UploadRow> {
        self.inner.lock().unwrap().uploads.clone()
    }

    /// Returns a copy of all staging-file rows, for inspection in tests.
    pub fn staging_files(&self) -> Vec<StagingFileRow> {
        self.inner.lock().unwrap().staging_files.clone()
    }

    /// Returns a copy of all load-file rows, for inspection in tests.
    pub fn load_files(&self) -> Vec<LoadFileRow> {
        self.inner.lock().unwrap().load_files.clone()
    }

    /// Inserts an upload row directly, simulating state from before a
    /// restart.
    pub fn seed_upload(&self, mut upload: UploadRow) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        upload.id = inner.next_upload_id;
        inner.next_upload_id += 1;
        let id = upload.id;
        inner.uploads.push(upload);
        id
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl WarehouseCatalog for MemoryCatalog {
    async fn insert_staging_file(&self, file: NewStagingFile) -> EgressResult<i64> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_staging_file_id;
        inner.next_staging_file_id += 1;
        inner.staging_files.push(StagingFileRow {
            id,
            location: file.location,
            source_id: file.source_id,
            destination_id: file.destination_id,
            schema: file.schema,
            status: StagingFileStatus::Waiting,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn set_staging_files_status(
        &self,
        ids: &[i64],
        status: StagingFileStatus,
    ) -> EgressResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for file in &mut inner.staging_files {
            if ids.contains(&file.id) {
                file.status = status;
            }
        }
        Ok(())
    }

    async fn staging_files_after(
        &self,
        source_id: &str,
        destination_id: &str,
        after_id: i64,
        limit: i64,
    ) -> EgressResult<Vec<StagingFileRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .staging_files
            .iter()
            .filter(|file| {
                file.id > after_id
                    && file.source_id == source_id
                    && file.destination_id == destination_id
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn staging_files_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> EgressResult<Vec<StagingFileRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .staging_files
            .iter()
            .filter(|file| {
                file.id >= start_id
                    && file.id <= end_id
                    && file.source_id == source_id
                    && file.destination_id == destination_id
            })
            .cloned()
            .collect())
    }

    async fn last_exported_staging_file_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> EgressResult<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .uploads
            .iter()
            .rev()
            .find(|upload| {
                upload.source_id == source_id
                    && upload.destination_id == destination_id
                    && upload.status.is_terminal()
            })
            .map(|upload| upload.end_staging_file_id)
            .unwrap_or(0))
    }

    async fn last_exported_load_file_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> EgressResult<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .uploads
            .iter()
            .rev()
            .find(|upload| {
                upload.source_id == source_id
                    && upload.destination_id == destination_id
                    && upload.status.is_terminal()
            })
            .map(|upload| upload.end_load_file_id)
            .unwrap_or(0))
    }

    async fn create_upload(&self, upload: NewUpload) -> EgressResult<UploadRow> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_upload_id;
        inner.next_upload_id += 1;
        let now = Utc::now();
        let row = UploadRow {
            id,
            source_id: upload.source_id,
            namespace: upload.namespace,
            destination_id: upload.destination_id,
            destination_type: upload.destination_type,
            start_staging_file_id: upload.start_staging_file_id,
            end_staging_file_id: upload.end_staging_file_id,
            start_load_file_id: upload.start_load_file_id,
            end_load_file_id: 0,
            status: UploadStatus::GeneratingLoadFile,
            schema: upload.schema,
            error: None,
            created_at: now,
            updated_at: now,
        };
        inner.uploads.push(row.clone());
        Ok(row)
    }

    async fn pending_upload(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> EgressResult<Option<UploadRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .uploads
            .iter()
            .find(|upload| {
                upload.source_id == source_id
                    && upload.destination_id == destination_id
                    && !upload.status.is_terminal()
            })
            .cloned())
    }

    async fn set_upload_status(&self, upload_id: i64, status: UploadStatus) -> EgressResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(upload) = inner.uploads.iter_mut().find(|upload| upload.id == upload_id) {
            upload.status = status;
            upload.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_upload_error(
        &self,
        upload_id: i64,
        status: UploadStatus,
        message: &str,
    ) -> EgressResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(upload) = inner.uploads.iter_mut().find(|upload| upload.id == upload_id) {
            let attempts = upload.error_attempts() + 1;
            upload.status = status;
            upload.error = Some(serde_json::json!({
                "message": message,
                "attempts": attempts,
            }));
            upload.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_upload_generated(
        &self,
        upload_id: i64,
        end_load_file_id: i64,
    ) -> EgressResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(upload) = inner.uploads.iter_mut().find(|upload| upload.id == upload_id) {
            upload.status = UploadStatus::GeneratedLoadFile;
            upload.end_load_file_id = end_load_file_id;
            upload.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_load_file(&self, file: NewLoadFile) -> EgressResult<i64> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_load_file_id;
        inner.next_load_file_id += 1;
        inner.load_files.push(LoadFileRow {
            id,
            staging_file_id: file.staging_file_id,
            source_id: file.source_id,
            destination_id: file.destination_id,
            destination_type: file.destination_type,
            table_name: file.table_name,
            location: file.location,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn last_load_file_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> EgressResult<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .load_files
            .iter()
            .rev()
            .find(|file| file.source_id == source_id && file.destination_id == destination_id)
            .map(|file| file.id)
            .unwrap_or(0))
    }

    async fn load_file_locations(
        &self,
        source_id: &str,
        destination_id: &str,
        table_name: &str,
        start_id: i64,
        end_id: i64,
    ) -> EgressResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .load_files
            .iter()
            .filter(|file| {
                file.source_id == source_id
                    && file.destination_id == destination_id
                    && file.table_name == table_name
                    && file.id > start_id
                    && file.id <= end_id
            })
            .map(|file| file.location.clone())
            .collect())
    }

    async fn current_schema(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> EgressResult<Option<SchemaRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .schemas
            .iter()
            .rev()
            .find(|schema| {
                schema.source_id == source_id && schema.destination_id == destination_id
            })
            .cloned())
    }

    async fn save_current_schema(&self, schema: NewSchema) -> EgressResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_schema_id;
        inner.next_schema_id += 1;
        inner.schemas.push(SchemaRow {
            id,
            wh_upload_id: schema.wh_upload_id,
            source_id: schema.source_id,
            namespace: schema.namespace,
            destination_id: schema.destination_id,
            destination_type: schema.destination_type,
            schema: schema.schema,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_staging_file(source_id: &str) -> NewStagingFile {
        NewStagingFile {
            location: "s3://bucket/key".into(),
            source_id: source_id.into(),
            destination_id: "dst1".into(),
            schema: serde_json::json!({"tracks": {"a": "int"}}),
        }
    }

    fn new_upload(start: i64, end: i64) -> NewUpload {
        NewUpload {
            source_id: "src1".into(),
            namespace: "ns".into(),
            destination_id: "dst1".into(),
            destination_type: "RS".into(),
            start_staging_file_id: start,
            end_staging_file_id: end,
            start_load_file_id: 0,
            schema: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn staging_files_page_after_last_export() {
        let catalog = MemoryCatalog::new();
        for _ in 0..3 {
            catalog
                .insert_staging_file(new_staging_file("src1"))
                .await
                .unwrap();
        }

        let all = catalog
            .staging_files_after("src1", "dst1", 0, 20)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        // Terminal upload covering the first two files hides them.
        let upload = catalog.create_upload(new_upload(1, 2)).await.unwrap();
        catalog
            .set_upload_status(upload.id, UploadStatus::ExportedData)
            .await
            .unwrap();

        let after = catalog
            .last_exported_staging_file_id("src1", "dst1")
            .await
            .unwrap();
        assert_eq!(after, 2);
        let remaining = catalog
            .staging_files_after("src1", "dst1", after, 20)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, 3);
    }

    #[tokio::test]
    async fn pending_upload_skips_terminal_rows() {
        let catalog = MemoryCatalog::new();
        let first = catalog.create_upload(new_upload(1, 2)).await.unwrap();
        catalog
            .set_upload_status(first.id, UploadStatus::ExportedData)
            .await
            .unwrap();
        assert!(catalog.pending_upload("src1", "dst1").await.unwrap().is_none());

        let second = catalog.create_upload(new_upload(3, 4)).await.unwrap();
        let pending = catalog.pending_upload("src1", "dst1").await.unwrap().unwrap();
        assert_eq!(pending.id, second.id);
        assert_eq!(pending.status, UploadStatus::GeneratingLoadFile);
    }

    #[tokio::test]
    async fn upload_error_increments_attempts() {
        let catalog = MemoryCatalog::new();
        let upload = catalog.create_upload(new_upload(1, 1)).await.unwrap();

        catalog
            .set_upload_error(upload.id, UploadStatus::ExportingDataFailed, "copy failed")
            .await
            .unwrap();
        catalog
            .set_upload_error(upload.id, UploadStatus::ExportingDataFailed, "copy failed again")
            .await
            .unwrap();

        let pending = catalog.pending_upload("src1", "dst1").await.unwrap().unwrap();
        assert_eq!(pending.error_attempts(), 2);
        assert_eq!(
            pending.error.as_ref().unwrap()["message"],
            serde_json::json!("copy failed again")
        );
    }

    #[tokio::test]
    async fn load_file_range_is_exclusive_start() {
        let catalog = MemoryCatalog::new();
        for table in ["tracks", "tracks", "users"] {
            catalog
                .insert_load_file(NewLoadFile {
                    staging_file_id: 1,
                    source_id: "src1".into(),
                    destination_id: "dst1".into(),
                    destination_type: "RS".into(),
                    table_name: table.into(),
                    location: format!("s3://b/{table}"),
                })
                .await
                .unwrap();
        }

        let locations = catalog
            .load_file_locations("src1", "dst1", "tracks", 1, 3)
            .await
            .unwrap();
        assert_eq!(locations.len(), 1);

        let all = catalog
            .load_file_locations("src1", "dst1", "tracks", 0, 3)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn current_schema_is_latest_row() {
        let catalog = MemoryCatalog::new();
        for (i, ty) in ["int", "string"].iter().enumerate() {
            catalog
                .save_current_schema(NewSchema {
                    wh_upload_id: i as i64 + 1,
                    source_id: "src1".into(),
                    namespace: "ns".into(),
                    destination_id: "dst1".into(),
                    destination_type: "RS".into(),
                    schema: serde_json::json!({"tracks": {"a": ty}}),
                })
                .await
                .unwrap();
        }

        let current = catalog.current_schema("src1", "dst1").await.unwrap().unwrap();
        assert_eq!(current.schema["tracks"]["a"], "string");
    }
}
