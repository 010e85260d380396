//! SQL helpers for the warehouse catalog tables.
//!
//! All functions take the pool and the configured table names; statements are
//! built at runtime because the table names are configurable.

use sqlx::PgPool;

use crate::types::{
    CatalogTables, NewLoadFile, NewSchema, NewStagingFile, NewUpload, SchemaRow, StagingFileRow,
    StagingFileStatus, UploadRow, UploadStatus,
};

/// Inserts a staging-file record in `waiting` state and returns its id.
pub async fn insert_staging_file(
    pool: &PgPool,
    tables: &CatalogTables,
    file: &NewStagingFile,
) -> sqlx::Result<i64> {
    let sql = format!(
        r#"
        insert into {} (location, source_id, destination_id, schema, status, created_at)
        values ($1, $2, $3, $4, $5, now())
        returning id
        "#,
        tables.staging_files
    );

    sqlx::query_scalar(&sql)
        .bind(&file.location)
        .bind(&file.source_id)
        .bind(&file.destination_id)
        .bind(&file.schema)
        .bind(StagingFileStatus::Waiting)
        .fetch_one(pool)
        .await
}

/// Sets the status of a set of staging files.
pub async fn set_staging_files_status(
    pool: &PgPool,
    tables: &CatalogTables,
    ids: &[i64],
    status: StagingFileStatus,
) -> sqlx::Result<()> {
    let sql = format!("update {} set status = $1 where id = any($2)", tables.staging_files);

    sqlx::query(&sql)
        .bind(status)
        .bind(ids)
        .execute(pool)
        .await?;

    Ok(())
}

/// Fetches up to `limit` staging files with id strictly greater than
/// `after_id` for a binding, ascending by id.
pub async fn staging_files_after(
    pool: &PgPool,
    tables: &CatalogTables,
    source_id: &str,
    destination_id: &str,
    after_id: i64,
    limit: i64,
) -> sqlx::Result<Vec<StagingFileRow>> {
    let sql = format!(
        r#"
        select id, location, source_id, destination_id, schema, status, created_at
        from {}
        where id > $1 and source_id = $2 and destination_id = $3
        order by id asc
        limit $4
        "#,
        tables.staging_files
    );

    sqlx::query_as(&sql)
        .bind(after_id)
        .bind(source_id)
        .bind(destination_id)
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// Fetches the staging files of an existing upload by id range, ascending.
pub async fn staging_files_in_range(
    pool: &PgPool,
    tables: &CatalogTables,
    source_id: &str,
    destination_id: &str,
    start_id: i64,
    end_id: i64,
) -> sqlx::Result<Vec<StagingFileRow>> {
    let sql = format!(
        r#"
        select id, location, source_id, destination_id, schema, status, created_at
        from {}
        where id >= $1 and id <= $2 and source_id = $3 and destination_id = $4
        order by id asc
        "#,
        tables.staging_files
    );

    sqlx::query_as(&sql)
        .bind(start_id)
        .bind(end_id)
        .bind(source_id)
        .bind(destination_id)
        .fetch_all(pool)
        .await
}

/// Returns the `end_staging_file_id` of the last terminal upload for a
/// binding, or 0 when no upload finished yet.
pub async fn last_exported_staging_file_id(
    pool: &PgPool,
    tables: &CatalogTables,
    source_id: &str,
    destination_id: &str,
) -> sqlx::Result<i64> {
    let sql = format!(
        r#"
        select end_staging_file_id
        from {}
        where source_id = $1 and destination_id = $2 and (status = $3 or status = $4)
        order by id desc
        limit 1
        "#,
        tables.uploads
    );

    let id: Option<i64> = sqlx::query_scalar(&sql)
        .bind(source_id)
        .bind(destination_id)
        .bind(UploadStatus::ExportedData)
        .bind(UploadStatus::Aborted)
        .fetch_optional(pool)
        .await?;

    Ok(id.unwrap_or(0))
}

/// Returns the `end_load_file_id` of the last terminal upload for a binding,
/// or 0 when no upload finished yet. New uploads use this as their
/// `start_load_file_id`.
pub async fn last_exported_load_file_id(
    pool: &PgPool,
    tables: &CatalogTables,
    source_id: &str,
    destination_id: &str,
) -> sqlx::Result<i64> {
    let sql = format!(
        r#"
        select end_load_file_id
        from {}
        where source_id = $1 and destination_id = $2 and (status = $3 or status = $4)
        order by id desc
        limit 1
        "#,
        tables.uploads
    );

    let id: Option<i64> = sqlx::query_scalar(&sql)
        .bind(source_id)
        .bind(destination_id)
        .bind(UploadStatus::ExportedData)
        .bind(UploadStatus::Aborted)
        .fetch_optional(pool)
        .await?;

    Ok(id.unwrap_or(0))
}

/// Inserts a new upload in `generating_load_file` state and returns the
/// stored row.
pub async fn insert_upload(
    pool: &PgPool,
    tables: &CatalogTables,
    upload: &NewUpload,
) -> sqlx::Result<UploadRow> {
    let sql = format!(
        r#"
        insert into {} (source_id, namespace, destination_id, destination_type,
                        start_staging_file_id, end_staging_file_id, start_load_file_id,
                        end_load_file_id, status, schema, error, created_at, updated_at)
        values ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9, null, now(), now())
        returning id, source_id, namespace, destination_id, destination_type,
                  start_staging_file_id, end_staging_file_id, start_load_file_id,
                  end_load_file_id, status, schema, error, created_at, updated_at
        "#,
        tables.uploads
    );

    sqlx::query_as(&sql)
        .bind(&upload.source_id)
        .bind(&upload.namespace)
        .bind(&upload.destination_id)
        .bind(&upload.destination_type)
        .bind(upload.start_staging_file_id)
        .bind(upload.end_staging_file_id)
        .bind(upload.start_load_file_id)
        .bind(UploadStatus::GeneratingLoadFile)
        .bind(&upload.schema)
        .fetch_one(pool)
        .await
}

/// Returns the single non-terminal upload for a binding, if any.
pub async fn pending_upload(
    pool: &PgPool,
    tables: &CatalogTables,
    source_id: &str,
    destination_id: &str,
) -> sqlx::Result<Option<UploadRow>> {
    let sql = format!(
        r#"
        select id, source_id, namespace, destination_id, destination_type,
               start_staging_file_id, end_staging_file_id, start_load_file_id,
               end_load_file_id, status, schema, error, created_at, updated_at
        from {}
        where source_id = $1 and destination_id = $2 and status != $3 and status != $4
        order by id asc
        limit 1
        "#,
        tables.uploads
    );

    sqlx::query_as(&sql)
        .bind(source_id)
        .bind(destination_id)
        .bind(UploadStatus::ExportedData)
        .bind(UploadStatus::Aborted)
        .fetch_optional(pool)
        .await
}

/// Moves an upload into a new state.
pub async fn set_upload_status(
    pool: &PgPool,
    tables: &CatalogTables,
    upload_id: i64,
    status: UploadStatus,
) -> sqlx::Result<()> {
    let sql = format!(
        "update {} set status = $1, updated_at = now() where id = $2",
        tables.uploads
    );

    sqlx::query(&sql)
        .bind(status)
        .bind(upload_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Moves an upload into a failed state, recording the error message and
/// incrementing the attempt counter carried in the error payload.
pub async fn set_upload_error(
    pool: &PgPool,
    tables: &CatalogTables,
    upload_id: i64,
    status: UploadStatus,
    message: &str,
) -> sqlx::Result<()> {
    let sql = format!(
        r#"
        update {}
        set status = $1,
            error = jsonb_build_object(
                'message', $2::text,
                'attempts', coalesce((error ->> 'attempts')::bigint, 0) + 1
            ),
            updated_at = now()
        where id = $3
        "#,
        tables.uploads
    );

    sqlx::query(&sql)
        .bind(status)
        .bind(message)
        .bind(upload_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Records the end of load-file generation for an upload.
pub async fn set_upload_generated(
    pool: &PgPool,
    tables: &CatalogTables,
    upload_id: i64,
    end_load_file_id: i64,
) -> sqlx::Result<()> {
    let sql = format!(
        "update {} set status = $1, end_load_file_id = $2, updated_at = now() where id = $3",
        tables.uploads
    );

    sqlx::query(&sql)
        .bind(UploadStatus::GeneratedLoadFile)
        .bind(end_load_file_id)
        .bind(upload_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Inserts a load-file record and returns its id.
pub async fn insert_load_file(
    pool: &PgPool,
    tables: &CatalogTables,
    file: &NewLoadFile,
) -> sqlx::Result<i64> {
    let sql = format!(
        r#"
        insert into {} (staging_file_id, location, source_id, destination_id,
                        destination_type, table_name, created_at)
        values ($1, $2, $3, $4, $5, $6, now())
        returning id
        "#,
        tables.load_files
    );

    sqlx::query_scalar(&sql)
        .bind(file.staging_file_id)
        .bind(&file.location)
        .bind(&file.source_id)
        .bind(&file.destination_id)
        .bind(&file.destination_type)
        .bind(&file.table_name)
        .fetch_one(pool)
        .await
}

/// Returns the highest load-file id recorded for a binding, or 0.
pub async fn last_load_file_id(
    pool: &PgPool,
    tables: &CatalogTables,
    source_id: &str,
    destination_id: &str,
) -> sqlx::Result<i64> {
    let sql = format!(
        r#"
        select id from {}
        where source_id = $1 and destination_id = $2
        order by id desc
        limit 1
        "#,
        tables.load_files
    );

    let id: Option<i64> = sqlx::query_scalar(&sql)
        .bind(source_id)
        .bind(destination_id)
        .fetch_optional(pool)
        .await?;

    Ok(id.unwrap_or(0))
}

/// Returns the object locations of a table's load files within an upload's
/// load-file id range `(start, end]`.
pub async fn load_file_locations(
    pool: &PgPool,
    tables: &CatalogTables,
    source_id: &str,
    destination_id: &str,
    table_name: &str,
    start_id: i64,
    end_id: i64,
) -> sqlx::Result<Vec<String>> {
    let sql = format!(
        r#"
        select location from {}
        where source_id = $1 and destination_id = $2 and table_name = $3
          and id > $4 and id <= $5
        order by id asc
        "#,
        tables.load_files
    );

    sqlx::query_scalar(&sql)
        .bind(source_id)
        .bind(destination_id)
        .bind(table_name)
        .bind(start_id)
        .bind(end_id)
        .fetch_all(pool)
        .await
}

/// Returns the latest schema row for a binding, if any. This is the current
/// schema of the destination.
pub async fn current_schema(
    pool: &PgPool,
    tables: &CatalogTables,
    source_id: &str,
    destination_id: &str,
) -> sqlx::Result<Option<SchemaRow>> {
    let sql = format!(
        r#"
        select id, wh_upload_id, source_id, namespace, destination_id,
               destination_type, schema, created_at
        from {}
        where source_id = $1 and destination_id = $2
        order by id desc
        limit 1
        "#,
        tables.schemas
    );

    sqlx::query_as(&sql)
        .bind(source_id)
        .bind(destination_id)
        .fetch_optional(pool)
        .await
}

/// Appends a new current-schema row for a binding.
pub async fn insert_schema(
    pool: &PgPool,
    tables: &CatalogTables,
    schema: &NewSchema,
) -> sqlx::Result<i64> {
    let sql = format!(
        r#"
        insert into {} (wh_upload_id, source_id, namespace, destination_id,
                        destination_type, schema, created_at)
        values ($1, $2, $3, $4, $5, $6, now())
        returning id
        "#,
        tables.schemas
    );

    sqlx::query_scalar(&sql)
        .bind(schema.wh_upload_id)
        .bind(&schema.source_id)
        .bind(&schema.namespace)
        .bind(&schema.destination_id)
        .bind(&schema.destination_type)
        .bind(&schema.schema)
        .fetch_one(pool)
        .await
}

