//! Idempotent DDL for the warehouse catalog.
//!
//! Run at service startup; every statement tolerates prior runs.

use sqlx::PgPool;

use crate::types::CatalogTables;

/// Creates the catalog enum types, tables and indexes if they do not exist.
pub async fn setup_catalog(pool: &PgPool, tables: &CatalogTables) -> sqlx::Result<()> {
    let staging_state_type = r#"
        do $$ begin
            create type wh_staging_file_state_type as enum (
                'waiting',
                'executing',
                'succeeded',
                'failed'
            );
        exception
            when duplicate_object then null;
        end $$;
    "#;
    sqlx::query(staging_state_type).execute(pool).await?;

    let upload_state_type = r#"
        do $$ begin
            create type wh_upload_state_type as enum (
                'generating_load_file',
                'generating_load_file_failed',
                'generated_load_file',
                'updating_schema',
                'updating_schema_failed',
                'updated_schema',
                'exporting_data',
                'exporting_data_failed',
                'exported_data',
                'aborted'
            );
        exception
            when duplicate_object then null;
        end $$;
    "#;
    sqlx::query(upload_state_type).execute(pool).await?;

    let staging_files = format!(
        r#"
        create table if not exists {} (
            id bigserial primary key,
            location text not null,
            source_id varchar(64) not null,
            destination_id varchar(64) not null,
            schema jsonb not null,
            status wh_staging_file_state_type not null,
            created_at timestamptz not null
        )
        "#,
        tables.staging_files
    );
    sqlx::query(&staging_files).execute(pool).await?;

    let staging_files_index = format!(
        "create index if not exists {0}_source_destination_id_index on {0} (source_id, destination_id)",
        tables.staging_files
    );
    sqlx::query(&staging_files_index).execute(pool).await?;

    let load_files = format!(
        r#"
        create table if not exists {} (
            id bigserial primary key,
            staging_file_id bigint not null,
            location text not null,
            source_id varchar(64) not null,
            destination_id varchar(64) not null,
            destination_type varchar(64) not null,
            table_name varchar(64) not null,
            created_at timestamptz not null
        )
        "#,
        tables.load_files
    );
    sqlx::query(&load_files).execute(pool).await?;

    let load_files_index = format!(
        "create index if not exists {0}_source_destination_id_index on {0} (source_id, destination_id)",
        tables.load_files
    );
    sqlx::query(&load_files_index).execute(pool).await?;

    let uploads = format!(
        r#"
        create table if not exists {} (
            id bigserial primary key,
            source_id varchar(64) not null,
            namespace varchar(64) not null,
            destination_id varchar(64) not null,
            destination_type varchar(64) not null,
            start_staging_file_id bigint not null,
            end_staging_file_id bigint not null,
            start_load_file_id bigint not null,
            end_load_file_id bigint not null,
            status wh_upload_state_type not null,
            schema jsonb not null,
            error jsonb,
            created_at timestamptz not null,
            updated_at timestamptz not null
        )
        "#,
        tables.uploads
    );
    sqlx::query(&uploads).execute(pool).await?;

    for index in [
        format!("create index if not exists {0}_id_index on {0} (id)", tables.uploads),
        format!(
            "create index if not exists {0}_status_index on {0} (status)",
            tables.uploads
        ),
        format!(
            "create index if not exists {0}_source_destination_id_index on {0} (source_id, destination_id)",
            tables.uploads
        ),
    ] {
        sqlx::query(&index).execute(pool).await?;
    }

    let schemas = format!(
        r#"
        create table if not exists {} (
            id bigserial primary key,
            wh_upload_id bigint not null,
            source_id varchar(64) not null,
            namespace varchar(64) not null,
            destination_id varchar(64) not null,
            destination_type varchar(64) not null,
            schema jsonb not null,
            created_at timestamptz not null
        )
        "#,
        tables.schemas
    );
    sqlx::query(&schemas).execute(pool).await?;

    let schemas_index = format!(
        "create index if not exists {0}_source_destination_id_index on {0} (source_id, destination_id)",
        tables.schemas
    );
    sqlx::query(&schemas_index).execute(pool).await?;

    Ok(())
}
