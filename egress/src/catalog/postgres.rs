use sqlx::PgPool;

use egress_config::shared::PgConnectionConfig;
use egress_postgres::types::{
    CatalogTables, NewLoadFile, NewSchema, NewStagingFile, NewUpload, SchemaRow, StagingFileRow,
    StagingFileStatus, UploadRow, UploadStatus,
};
use egress_postgres::{catalog, db, setup};

use crate::catalog::WarehouseCatalog;
use crate::error::EgressResult;

const NUM_POOL_CONNECTIONS: u32 = 8;

/// Warehouse catalog persisted in Postgres.
#[derive(Debug, Clone)]
pub struct PostgresCatalog {
    pool: PgPool,
    tables: CatalogTables,
}

impl PostgresCatalog {
    /// Connects to the catalog database and runs the idempotent DDL.
    pub async fn connect(config: &PgConnectionConfig) -> EgressResult<Self> {
        let pool = db::connect_to_catalog(config, NUM_POOL_CONNECTIONS).await?;
        Self::with_pool(pool).await
    }

    /// Wraps an existing pool with default table names and runs the DDL.
    pub async fn with_pool(pool: PgPool) -> EgressResult<Self> {
        Self::with_pool_and_tables(pool, CatalogTables::default()).await
    }

    /// Wraps an existing pool with custom table names and runs the DDL.
    pub async fn with_pool_and_tables(pool: PgPool, tables: CatalogTables) -> EgressResult<Self> {
        setup::setup_catalog(&pool, &tables).await?;
        Ok(Self { pool, tables })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl WarehouseCatalog for PostgresCatalog {
    async fn insert_staging_file(&self, file: NewStagingFile) -> EgressResult<i64> {
        Ok(catalog::insert_staging_file(&self.pool, &self.tables, &file).await?)
    }

    async fn set_staging_files_status(
        &self,
        ids: &[i64],
        status: StagingFileStatus,
    ) -> EgressResult<()> {
        Ok(catalog::set_staging_files_status(&self.pool, &self.tables, ids, status).await?)
    }

    async fn staging_files_after(
        &self,
        source_id: &str,
        destination_id: &str,
        after_id: i64,
        limit: i64,
    ) -> EgressResult<Vec<StagingFileRow>> {
        Ok(catalog::staging_files_after(
            &self.pool,
            &self.tables,
            source_id,
            destination_id,
            after_id,
            limit,
        )
        .await?)
    }

    async fn staging_files_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> EgressResult<Vec<StagingFileRow>> {
        Ok(catalog::staging_files_in_range(
            &self.pool,
            &self.tables,
            source_id,
            destination_id,
            start_id,
            end_id,
        )
        .await?)
    }

    async fn last_exported_staging_file_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> EgressResult<i64> {
        Ok(catalog::last_exported_staging_file_id(
            &self.pool,
            &self.tables,
            source_id,
            destination_id,
        )
        .await?)
    }

    async fn last_exported_load_file_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> EgressResult<i64> {
        Ok(
            catalog::last_exported_load_file_id(&self.pool, &self.tables, source_id, destination_id)
                .await?,
        )
    }

    async fn create_upload(&self, upload: NewUpload) -> EgressResult<UploadRow> {
        Ok(catalog::insert_upload(&self.pool, &self.tables, &upload).await?)
    }

    async fn pending_upload(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> EgressResult<Option<UploadRow>> {
        Ok(catalog::pending_upload(&self.pool, &self.tables, source_id, destination_id).await?)
    }

    async fn set_upload_status(&self, upload_id: i64, status: UploadStatus) -> EgressResult<()> {
        Ok(catalog::set_upload_status(&self.pool, &self.tables, upload_id, status).await?)
    }

    async fn set_upload_error(
        &self,
        upload_id: i64,
        status: UploadStatus,
        message: &str,
    ) -> EgressResult<()> {
        Ok(catalog::set_upload_error(&self.pool, &self.tables, upload_id, status, message).await?)
    }

    async fn set_upload_generated(
        &self,
        upload_id: i64,
        end_load_file_id: i64,
    ) -> EgressResult<()> {
        Ok(
            catalog::set_upload_generated(&self.pool, &self.tables, upload_id, end_load_file_id)
                .await?,
        )
    }

    async fn insert_load_file(&self, file: NewLoadFile) -> EgressResult<i64> {
        Ok(catalog::insert_load_file(&self.pool, &self.tables, &file).await?)
    }

    async fn last_load_file_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> EgressResult<i64> {
        Ok(catalog::last_load_file_id(&self.pool, &self.tables, source_id, destination_id).await?)
    }

    async fn load_file_locations(
        &self,
        source_id: &str,
        destination_id: &str,
        table_name: &str,
        start_id: i64,
        end_id: i64,
    ) -> EgressResult<Vec<String>> {
        Ok(catalog::load_file_locations(
            &self.pool,
            &self.tables,
            source_id,
            destination_id,
            table_name,
            start_id,
            end_id,
        )
        .await?)
    }

    async fn current_schema(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> EgressResult<Option<SchemaRow>> {
        Ok(catalog::current_schema(&self.pool, &self.tables, source_id, destination_id).await?)
    }

    async fn save_current_schema(&self, schema: NewSchema) -> EgressResult<()> {
        catalog::insert_schema(&self.pool, &self.tables, &schema).await?;
        Ok(())
    }
}
