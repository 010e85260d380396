//! Redshift dialect: schema migration and manifest-driven COPY/merge.
//!
//! Loads go through a per-table staging table inside a per-table
//! transaction: COPY from a manifest of load-file URLs, delete the rows
//! being replaced, insert the deduplicated staging rows. Staging tables are
//! dropped after the join regardless of outcome.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use chrono::Utc;

use crate::error::{EgressError, EgressResult, ErrorKind};
use crate::storage::{ObjectStoreClient, Storage, StorageProvider};
use crate::types::{Binding, SchemaDiff, TableColumns};
use crate::warehouse::base::{ExportPlan, TableExportPlan, Warehouse, WarehouseFactory};

/// SQLSTATE for `column already exists`.
const DUPLICATE_COLUMN: &str = "42701";

const NUM_POOL_CONNECTIONS: u32 = 4;

/// Maps a logical column type to its Redshift type.
fn map_type(column_type: &str) -> &'static str {
    match column_type {
        "boolean" => "boolean",
        "int" | "bigint" | "float" => "double precision",
        "datetime" => "timestamp",
        _ => "varchar(512)",
    }
}

fn columns_with_types(columns: &TableColumns) -> String {
    columns
        .iter()
        .map(|(name, column_type)| format!("{} {}", name, map_type(column_type)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn create_table_sql(namespace: &str, table: &str, columns: &TableColumns) -> String {
    format!(
        r#"create table if not exists {namespace}."{table}" ( {} ) sortkey(received_at)"#,
        columns_with_types(columns)
    )
}

fn add_column_sql(namespace: &str, table: &str, column: &str, column_type: &str) -> String {
    format!(
        r#"alter table {namespace}."{table}" add column {column} {}"#,
        map_type(column_type)
    )
}

fn copy_sql(
    namespace: &str,
    staging_table: &str,
    sorted_columns: &[String],
    manifest_location: &str,
    access_key_id: &str,
    secret_access_key: &str,
    region: &str,
) -> String {
    format!(
        "copy {namespace}.\"{staging_table}\" ({}) from '{manifest_location}' \
         csv gzip access_key_id '{access_key_id}' secret_access_key '{secret_access_key}' \
         region '{region}' dateformat 'auto' timeformat 'auto' manifest \
         truncatecolumns emptyasnull blanksasnull fillrecord acceptanydate \
         trimblanks acceptinvchars compupdate off",
        sorted_columns.join(", ")
    )
}

fn delete_sql(namespace: &str, table: &str, staging_table: &str, primary_key: &str) -> String {
    format!(
        r#"delete from {namespace}."{table}" using {namespace}."{staging_table}" _staged where _staged.{primary_key} = {namespace}.{table}.{primary_key}"#
    )
}

fn insert_sql(
    namespace: &str,
    table: &str,
    staging_table: &str,
    sorted_columns: &[String],
    primary_key: &str,
) -> String {
    let quoted_columns = sorted_columns
        .iter()
        .map(|column| format!("\"{column}\""))
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "insert into {namespace}.\"{table}\" ({quoted_columns}) select {quoted_columns} from ( \
         select *, row_number() over (partition by {primary_key} order by received_at asc) \
         as _staging_row_number from {namespace}.\"{staging_table}\" ) as _deduped \
         where _staging_row_number = 1"
    )
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    url: String,
    mandatory: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: Vec<ManifestEntry>,
}

struct RedshiftContext {
    pool: PgPool,
    namespace: String,
    manifest_client: ObjectStoreClient,
    manifest_folder: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    source_id: String,
    destination_id: String,
}

/// One per-upload connection to a Redshift destination.
pub struct RedshiftWarehouse {
    ctx: Arc<RedshiftContext>,
}

impl RedshiftWarehouse {
    async fn create_table(
        ctx: &RedshiftContext,
        table: &str,
        columns: &TableColumns,
    ) -> EgressResult<()> {
        let sql = create_table_sql(&ctx.namespace, table, columns);
        sqlx::query(&sql).execute(&ctx.pool).await?;
        Ok(())
    }

    async fn add_column(
        ctx: &RedshiftContext,
        table: &str,
        column: &str,
        column_type: &str,
    ) -> EgressResult<()> {
        let sql = add_column_sql(&ctx.namespace, table, column, column_type);
        match sqlx::query(&sql).execute(&ctx.pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(DUPLICATE_COLUMN) =>
            {
                debug!("column {column} already exists on {table}, ignoring");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Uploads a manifest of the table's load-file URLs and returns its
    /// location.
    async fn generate_manifest(
        ctx: &RedshiftContext,
        plan: &TableExportPlan,
    ) -> EgressResult<String> {
        let manifest = Manifest {
            entries: plan
                .load_file_locations
                .iter()
                .map(|location| ManifestEntry {
                    url: location.clone(),
                    mandatory: true,
                })
                .collect(),
        };
        let body = serde_json::to_vec(&manifest)?;

        let date = Utc::now().format("%m-%d-%Y").to_string();
        let manifest_id = Uuid::new_v4().to_string();
        let stored = ctx
            .manifest_client
            .upload(
                body,
                &[
                    ctx.manifest_folder.as_str(),
                    ctx.source_id.as_str(),
                    ctx.destination_id.as_str(),
                    date.as_str(),
                    plan.table.as_str(),
                    manifest_id.as_str(),
                ],
            )
            .await?;

        Ok(stored.location)
    }

    /// Loads one table: manifest, staging table, transactional COPY and
    /// merge.
    async fn export_table(
        ctx: Arc<RedshiftContext>,
        plan: TableExportPlan,
        staging_tables: Arc<Mutex<Vec<String>>>,
    ) -> EgressResult<()> {
        if plan.load_file_locations.is_empty() {
            debug!("no load files for table {}, skipping", plan.table);
            return Ok(());
        }

        let manifest_location = Self::generate_manifest(&ctx, &plan).await?;

        let staging_table = format!("staging-{}-{}", plan.table, Uuid::new_v4());
        Self::create_table(&ctx, &staging_table, &plan.columns).await?;
        staging_tables
            .lock()
            .expect("staging table list poisoned")
            .push(staging_table.clone());

        let mut tx = ctx.pool.begin().await?;

        let copy = copy_sql(
            &ctx.namespace,
            &staging_table,
            &plan.sorted_columns,
            &manifest_location,
            &ctx.access_key_id,
            &ctx.secret_access_key,
            &ctx.region,
        );
        sqlx::query(&copy).execute(&mut *tx).await?;

        let delete = delete_sql(&ctx.namespace, &plan.table, &staging_table, &plan.primary_key);
        sqlx::query(&delete).execute(&mut *tx).await?;

        let insert = insert_sql(
            &ctx.namespace,
            &plan.table,
            &staging_table,
            &plan.sorted_columns,
            &plan.primary_key,
        );
        sqlx::query(&insert).execute(&mut *tx).await?;

        tx.commit().await?;

        Ok(())
    }

    async fn drop_staging_tables(ctx: &RedshiftContext, staging_tables: Vec<String>) {
        for staging_table in staging_tables {
            let sql = format!(
                r#"drop table if exists {}."{staging_table}""#,
                ctx.namespace
            );
            if let Err(err) = sqlx::query(&sql).execute(&ctx.pool).await {
                warn!("failed to drop staging table {staging_table}: {err}");
            }
        }
    }
}

impl Warehouse for RedshiftWarehouse {
    async fn ensure_namespace(&self) -> EgressResult<()> {
        let sql = format!("create schema if not exists {}", self.ctx.namespace);
        sqlx::query(&sql).execute(&self.ctx.pool).await?;
        Ok(())
    }

    async fn migrate(&self, diff: &SchemaDiff) -> EgressResult<()> {
        for (table, columns) in &diff.new_tables {
            Self::create_table(&self.ctx, table, columns).await?;
        }

        for (table, columns) in &diff.added_columns {
            for (column, column_type) in columns {
                Self::add_column(&self.ctx, table, column, column_type).await?;
            }
        }

        Ok(())
    }

    async fn export(&self, plan: &ExportPlan) -> EgressResult<()> {
        let staging_tables = Arc::new(Mutex::new(Vec::new()));
        let mut join_set = JoinSet::new();

        for table_plan in plan.tables.clone() {
            join_set.spawn(Self::export_table(
                self.ctx.clone(),
                table_plan,
                staging_tables.clone(),
            ));
        }

        let mut first_error: Option<EgressError> = None;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(crate::egress_error!(
                            ErrorKind::InvalidState,
                            "Table export task panicked",
                            err
                        ));
                    }
                }
            }
        }

        let created = staging_tables
            .lock()
            .expect("staging table list poisoned")
            .drain(..)
            .collect();
        Self::drop_staging_tables(&self.ctx, created).await;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Builds [`RedshiftWarehouse`] connections from destination configuration.
#[derive(Clone)]
pub struct RedshiftFactory {
    storage: Storage,
}

impl RedshiftFactory {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

impl WarehouseFactory for RedshiftFactory {
    type Warehouse = RedshiftWarehouse;

    async fn connect(&self, binding: &Binding, namespace: &str) -> EgressResult<RedshiftWarehouse> {
        let connection = binding.destination.warehouse_config()?;
        let storage_config = binding.destination.storage_config()?;

        let port: u16 = connection.port.parse().map_err(|_| {
            crate::egress_error!(
                ErrorKind::ConfigError,
                "Invalid Redshift port",
                connection.port
            )
        })?;

        let options = PgConnectOptions::new_without_pgpass()
            .host(&connection.host)
            .port(port)
            .username(&connection.user)
            .password(&connection.password)
            .database(&connection.database)
            .ssl_mode(PgSslMode::Prefer);

        let pool = PgPoolOptions::new()
            .max_connections(NUM_POOL_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|err| {
                crate::egress_error!(
                    ErrorKind::WarehouseConnectionFailed,
                    "Failed to connect to Redshift",
                    err
                )
            })?;

        let settings = self.storage.settings();
        let manifest_client = self.storage.client(
            StorageProvider::S3,
            &storage_config.bucket_name,
            &storage_config,
        )?;

        let access_key_id = storage_config
            .access_key_id
            .clone()
            .or_else(|| settings.aws_access_key_id.as_ref().map(|key| key.expose().to_owned()))
            .unwrap_or_default();
        let secret_access_key = storage_config
            .access_key
            .clone()
            .or_else(|| {
                settings
                    .aws_secret_access_key
                    .as_ref()
                    .map(|key| key.expose().to_owned())
            })
            .unwrap_or_default();
        let region = storage_config
            .region
            .clone()
            .unwrap_or_else(|| settings.default_copy_region.clone());

        Ok(RedshiftWarehouse {
            ctx: Arc::new(RedshiftContext {
                pool,
                namespace: namespace.to_owned(),
                manifest_client,
                manifest_folder: settings.manifest_folder.clone(),
                region,
                access_key_id,
                secret_access_key,
                source_id: binding.source.id.clone(),
                destination_id: binding.destination.id.clone(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(pairs: &[(&str, &str)]) -> TableColumns {
        pairs
            .iter()
            .map(|(name, ty)| (name.to_string(), ty.to_string()))
            .collect()
    }

    #[test]
    fn type_mapping_follows_dialect() {
        assert_eq!(map_type("boolean"), "boolean");
        assert_eq!(map_type("int"), "double precision");
        assert_eq!(map_type("bigint"), "double precision");
        assert_eq!(map_type("float"), "double precision");
        assert_eq!(map_type("string"), "varchar(512)");
        assert_eq!(map_type("datetime"), "timestamp");
    }

    #[test]
    fn create_table_declares_sortkey() {
        let sql = create_table_sql(
            "ns",
            "tracks",
            &columns(&[("a", "int"), ("received_at", "datetime")]),
        );
        assert_eq!(
            sql,
            r#"create table if not exists ns."tracks" ( a double precision, received_at timestamp ) sortkey(received_at)"#
        );
    }

    #[test]
    fn add_column_maps_type() {
        let sql = add_column_sql("ns", "tracks", "b", "string");
        assert_eq!(sql, r#"alter table ns."tracks" add column b varchar(512)"#);
    }

    #[test]
    fn copy_carries_manifest_and_load_options() {
        let sql = copy_sql(
            "ns",
            "staging-tracks-x",
            &["a".to_string(), "b".to_string()],
            "s3://bucket/manifests/m1",
            "AKIA",
            "SECRET",
            "us-east-1",
        );
        assert!(sql.starts_with(r#"copy ns."staging-tracks-x" (a, b) from 's3://bucket/manifests/m1'"#));
        for option in [
            "csv gzip",
            "manifest",
            "truncatecolumns",
            "emptyasnull",
            "blanksasnull",
            "fillrecord",
            "acceptanydate",
            "trimblanks",
            "acceptinvchars",
            "compupdate off",
            "region 'us-east-1'",
        ] {
            assert!(sql.contains(option), "missing option: {option}");
        }
    }

    #[test]
    fn upsert_deletes_then_inserts_latest_row() {
        let delete = delete_sql("ns", "tracks", "staging-tracks-x", "id");
        assert_eq!(
            delete,
            r#"delete from ns."tracks" using ns."staging-tracks-x" _staged where _staged.id = ns.tracks.id"#
        );

        let insert = insert_sql(
            "ns",
            "tracks",
            "staging-tracks-x",
            &["a".to_string(), "id".to_string()],
            "id",
        );
        assert!(insert.contains(r#"insert into ns."tracks" ("a","id") select "a","id""#));
        assert!(insert.contains("row_number() over (partition by id order by received_at asc)"));
        assert!(insert.contains("where _staging_row_number = 1"));
    }

    #[test]
    fn manifest_entries_are_mandatory() {
        let manifest = Manifest {
            entries: vec![ManifestEntry {
                url: "s3://bucket/load/tracks.csv.gz".into(),
                mandatory: true,
            }],
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "entries": [{"url": "s3://bucket/load/tracks.csv.gz", "mandatory": true}]
            })
        );
    }
}
