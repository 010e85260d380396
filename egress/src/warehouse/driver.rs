//! The upload state machine.
//!
//! Owns every status transition of an upload and the persistence of the
//! merged current schema; the dialect behind the [`Warehouse`] trait only
//! talks to the destination. Failures land in the stage's `_failed` state
//! with the error recorded on the upload row, leaving the upload resumable.

use tracing::{debug, info};

use egress_postgres::types::{NewSchema, UploadRow, UploadStatus};

use crate::catalog::WarehouseCatalog;
use crate::error::EgressResult;
use crate::types::{WarehouseSchema, schema_diff, schema_from_value};
use crate::warehouse::base::{ExportPlan, TableExportPlan, Warehouse, primary_key};

/// Where to pick up an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStage {
    /// Fresh upload: migrate the schema, then export.
    Full,
    /// Resume from schema migration.
    UpdateSchema,
    /// Schema already applied: export only.
    ExportData,
}

/// Drives an upload from `stage` to `exported_data` or a `_failed` state.
pub async fn process_upload<C, W>(
    catalog: &C,
    warehouse: &W,
    upload: &UploadRow,
    stage: ProcessStage,
) -> EgressResult<()>
where
    C: WarehouseCatalog,
    W: Warehouse,
{
    debug!(
        "processing upload {} for {}.{} from stage {:?}",
        upload.id, upload.source_id, upload.destination_id, stage
    );

    match stage {
        ProcessStage::ExportData => export(catalog, warehouse, upload).await,
        ProcessStage::Full | ProcessStage::UpdateSchema => {
            if migrate_schema(catalog, warehouse, upload).await? {
                export(catalog, warehouse, upload).await
            } else {
                Ok(())
            }
        }
    }
}

/// Applies the upload's schema to the destination.
///
/// Returns whether migration succeeded and export may proceed.
async fn migrate_schema<C, W>(
    catalog: &C,
    warehouse: &W,
    upload: &UploadRow,
) -> EgressResult<bool>
where
    C: WarehouseCatalog,
    W: Warehouse,
{
    catalog
        .set_upload_status(upload.id, UploadStatus::UpdatingSchema)
        .await?;

    let current = catalog
        .current_schema(&upload.source_id, &upload.destination_id)
        .await?;
    let current_schema = match &current {
        Some(row) => schema_from_value(&row.schema)?,
        None => WarehouseSchema::new(),
    };
    let target = schema_from_value(&upload.schema)?;
    let diff = schema_diff(&current_schema, &target);

    let migration = async {
        if current_schema.is_empty() {
            warehouse.ensure_namespace().await?;
        }
        warehouse.migrate(&diff).await
    };

    if let Err(err) = migration.await {
        catalog
            .set_upload_error(upload.id, UploadStatus::UpdatingSchemaFailed, &err.to_string())
            .await?;
        return Ok(false);
    }

    catalog
        .set_upload_status(upload.id, UploadStatus::UpdatedSchema)
        .await?;
    catalog
        .save_current_schema(NewSchema {
            wh_upload_id: upload.id,
            source_id: upload.source_id.clone(),
            namespace: upload.namespace.clone(),
            destination_id: upload.destination_id.clone(),
            destination_type: upload.destination_type.clone(),
            schema: serde_json::to_value(&diff.updated)?,
        })
        .await?;

    info!(
        "updated schema for upload {} in namespace {}",
        upload.id, upload.namespace
    );

    Ok(true)
}

/// Loads the upload's tables into the destination.
async fn export<C, W>(catalog: &C, warehouse: &W, upload: &UploadRow) -> EgressResult<()>
where
    C: WarehouseCatalog,
    W: Warehouse,
{
    catalog
        .set_upload_status(upload.id, UploadStatus::ExportingData)
        .await?;

    let plan = build_export_plan(catalog, upload).await?;

    if let Err(err) = warehouse.export(&plan).await {
        catalog
            .set_upload_error(upload.id, UploadStatus::ExportingDataFailed, &err.to_string())
            .await?;
        return Ok(());
    }

    catalog
        .set_upload_status(upload.id, UploadStatus::ExportedData)
        .await?;

    info!("exported upload {} to {}", upload.id, upload.destination_id);

    Ok(())
}

async fn build_export_plan<C>(catalog: &C, upload: &UploadRow) -> EgressResult<ExportPlan>
where
    C: WarehouseCatalog,
{
    let schema = schema_from_value(&upload.schema)?;
    let sorted = crate::types::sorted_table_columns(&schema);

    let mut tables = Vec::with_capacity(schema.len());
    for (table, columns) in &schema {
        let load_file_locations = catalog
            .load_file_locations(
                &upload.source_id,
                &upload.destination_id,
                table,
                upload.start_load_file_id,
                upload.end_load_file_id,
            )
            .await?;

        tables.push(TableExportPlan {
            table: table.clone(),
            columns: columns.clone(),
            sorted_columns: sorted.get(table).cloned().unwrap_or_default(),
            primary_key: primary_key(table).to_owned(),
            load_file_locations,
        });
    }

    Ok(ExportPlan {
        upload_id: upload.id,
        namespace: upload.namespace.clone(),
        tables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use egress_postgres::types::{NewLoadFile, NewUpload};

    use crate::catalog::MemoryCatalog;
    use crate::warehouse::memory::MemoryWarehouseState;

    async fn seeded_upload(catalog: &MemoryCatalog) -> UploadRow {
        catalog
            .create_upload(NewUpload {
                source_id: "src1".into(),
                namespace: "ns".into(),
                destination_id: "dst1".into(),
                destination_type: "RS".into(),
                start_staging_file_id: 1,
                end_staging_file_id: 1,
                start_load_file_id: 0,
                schema: serde_json::json!({"tracks": {"a": "int", "received_at": "datetime"}}),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn full_flow_reaches_exported_data() {
        let catalog = MemoryCatalog::new();
        let state = MemoryWarehouseState::new();
        let warehouse = state.warehouse("ns");
        let mut upload = seeded_upload(&catalog).await;

        catalog
            .insert_load_file(NewLoadFile {
                staging_file_id: 1,
                source_id: "src1".into(),
                destination_id: "dst1".into(),
                destination_type: "RS".into(),
                table_name: "tracks".into(),
                location: "s3://b/tracks.csv.gz".into(),
            })
            .await
            .unwrap();
        catalog.set_upload_generated(upload.id, 1).await.unwrap();
        upload.end_load_file_id = 1;

        process_upload(&catalog, &warehouse, &upload, ProcessStage::Full)
            .await
            .unwrap();

        let stored = &catalog.uploads()[0];
        assert_eq!(stored.status, UploadStatus::ExportedData);

        // Schema made it into the destination and the catalog.
        assert!(state.tables("ns")["tracks"].contains_key("a"));
        let current = catalog.current_schema("src1", "dst1").await.unwrap().unwrap();
        assert_eq!(current.schema["tracks"]["a"], "int");

        // Export saw the load file.
        let exports = state.exports();
        assert_eq!(exports.len(), 1);
        assert_eq!(
            exports[0].tables[0].load_file_locations,
            vec!["s3://b/tracks.csv.gz"]
        );
    }

    #[tokio::test]
    async fn export_stage_skips_migration() {
        let catalog = MemoryCatalog::new();
        let state = MemoryWarehouseState::new();
        let warehouse = state.warehouse("ns");
        let upload = seeded_upload(&catalog).await;

        process_upload(&catalog, &warehouse, &upload, ProcessStage::ExportData)
            .await
            .unwrap();

        assert_eq!(catalog.uploads()[0].status, UploadStatus::ExportedData);
        // No migration ran, so the destination has no tables.
        assert!(state.tables("ns").is_empty());
    }

    #[tokio::test]
    async fn migration_failure_marks_updating_schema_failed() {
        let catalog = MemoryCatalog::new();
        let state = MemoryWarehouseState::new();
        state.fail_next_migrate("schema locked");
        let warehouse = state.warehouse("ns");
        let upload = seeded_upload(&catalog).await;

        process_upload(&catalog, &warehouse, &upload, ProcessStage::Full)
            .await
            .unwrap();

        let stored = &catalog.uploads()[0];
        assert_eq!(stored.status, UploadStatus::UpdatingSchemaFailed);
        assert_eq!(stored.error_attempts(), 1);
        assert!(catalog.current_schema("src1", "dst1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn export_failure_marks_exporting_data_failed() {
        let catalog = MemoryCatalog::new();
        let state = MemoryWarehouseState::new();
        state.fail_next_export("copy timed out");
        let warehouse = state.warehouse("ns");
        let upload = seeded_upload(&catalog).await;

        process_upload(&catalog, &warehouse, &upload, ProcessStage::Full)
            .await
            .unwrap();

        let stored = &catalog.uploads()[0];
        assert_eq!(stored.status, UploadStatus::ExportingDataFailed);
        assert!(
            stored.error.as_ref().unwrap()["message"]
                .as_str()
                .unwrap()
                .contains("copy timed out")
        );
        // Schema migration still succeeded and was persisted.
        let current = catalog.current_schema("src1", "dst1").await.unwrap();
        assert!(current.is_some());
    }

    #[tokio::test]
    async fn second_upload_migrates_only_the_diff() {
        let catalog = MemoryCatalog::new();
        let state = MemoryWarehouseState::new();
        let warehouse = state.warehouse("ns");

        let upload = seeded_upload(&catalog).await;
        process_upload(&catalog, &warehouse, &upload, ProcessStage::Full)
            .await
            .unwrap();

        let second = catalog
            .create_upload(NewUpload {
                source_id: "src1".into(),
                namespace: "ns".into(),
                destination_id: "dst1".into(),
                destination_type: "RS".into(),
                start_staging_file_id: 2,
                end_staging_file_id: 2,
                start_load_file_id: 0,
                schema: serde_json::json!({"tracks": {"a": "string", "b": "string"}}),
            })
            .await
            .unwrap();
        process_upload(&catalog, &warehouse, &second, ProcessStage::Full)
            .await
            .unwrap();

        // `a` keeps its original type, `b` was added.
        let tables = state.tables("ns");
        assert_eq!(tables["tracks"]["a"], "int");
        assert_eq!(tables["tracks"]["b"], "string");

        let current = catalog.current_schema("src1", "dst1").await.unwrap().unwrap();
        assert_eq!(current.schema["tracks"]["a"], "int");
        assert_eq!(current.schema["tracks"]["b"], "string");
        assert_eq!(current.wh_upload_id, second.id);
    }
}
