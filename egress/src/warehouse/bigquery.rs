//! BigQuery dialect: dataset/table DDL and staged LOAD/MERGE, all through
//! the query API.
//!
//! Load files for BigQuery are newline-delimited JSON in GCS; each table is
//! loaded into a staging table with `LOAD DATA INTO ... FROM FILES` and
//! merged on the primary key, keeping the record with the latest
//! `received_at`.

use std::sync::{Arc, Mutex};

use gcp_bigquery_client::Client;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::yup_oauth2::parse_service_account_key;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EgressError, EgressResult, ErrorKind};
use crate::types::{Binding, SchemaDiff, TableColumns};
use crate::warehouse::base::{ExportPlan, TableExportPlan, Warehouse, WarehouseFactory};

/// Maps a logical column type to its BigQuery type.
fn map_type(column_type: &str) -> &'static str {
    match column_type {
        "boolean" => "bool",
        "int" | "bigint" => "int64",
        "float" => "float64",
        "datetime" => "timestamp",
        _ => "string",
    }
}

fn columns_with_types(columns: &TableColumns) -> String {
    columns
        .iter()
        .map(|(name, column_type)| format!("`{}` {}", name, map_type(column_type)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn create_dataset_sql(project_id: &str, namespace: &str) -> String {
    format!("create schema if not exists `{project_id}.{namespace}`")
}

fn create_table_sql(
    project_id: &str,
    namespace: &str,
    table: &str,
    columns: &TableColumns,
) -> String {
    format!(
        "create table if not exists `{project_id}.{namespace}.{table}` ( {} )",
        columns_with_types(columns)
    )
}

fn add_column_sql(
    project_id: &str,
    namespace: &str,
    table: &str,
    column: &str,
    column_type: &str,
) -> String {
    format!(
        "alter table `{project_id}.{namespace}.{table}` add column if not exists `{column}` {}",
        map_type(column_type)
    )
}

fn load_sql(project_id: &str, namespace: &str, staging_table: &str, uris: &[String]) -> String {
    let uri_list = uris
        .iter()
        .map(|uri| format!("'{uri}'"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "load data into `{project_id}.{namespace}.{staging_table}` \
         from files (format = 'JSON', uris = [{uri_list}])"
    )
}

fn merge_sql(
    project_id: &str,
    namespace: &str,
    table: &str,
    staging_table: &str,
    sorted_columns: &[String],
    primary_key: &str,
) -> String {
    let assignments = sorted_columns
        .iter()
        .map(|column| format!("`{column}` = _staged.`{column}`"))
        .collect::<Vec<_>>()
        .join(", ");
    let column_list = sorted_columns
        .iter()
        .map(|column| format!("`{column}`"))
        .collect::<Vec<_>>()
        .join(", ");
    let value_list = sorted_columns
        .iter()
        .map(|column| format!("_staged.`{column}`"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "merge `{project_id}.{namespace}.{table}` _target using ( \
         select * except(_staging_row_number) from ( \
         select *, row_number() over (partition by {primary_key} order by received_at asc) \
         as _staging_row_number from `{project_id}.{namespace}.{staging_table}` ) \
         where _staging_row_number = 1 ) _staged \
         on _target.{primary_key} = _staged.{primary_key} \
         when matched then update set {assignments} \
         when not matched then insert ({column_list}) values ({value_list})"
    )
}

fn drop_table_sql(project_id: &str, namespace: &str, table: &str) -> String {
    format!("drop table if exists `{project_id}.{namespace}.{table}`")
}

struct BigQueryContext {
    client: Client,
    project_id: String,
    namespace: String,
}

impl BigQueryContext {
    async fn run(&self, sql: String) -> EgressResult<()> {
        debug!("running bigquery statement: {sql}");
        self.client
            .job()
            .query(&self.project_id, QueryRequest::new(sql))
            .await?;
        Ok(())
    }
}

/// One per-upload connection to a BigQuery destination.
pub struct BigQueryWarehouse {
    ctx: Arc<BigQueryContext>,
}

impl BigQueryWarehouse {
    async fn export_table(
        ctx: Arc<BigQueryContext>,
        plan: TableExportPlan,
        staging_tables: Arc<Mutex<Vec<String>>>,
    ) -> EgressResult<()> {
        if plan.load_file_locations.is_empty() {
            debug!("no load files for table {}, skipping", plan.table);
            return Ok(());
        }

        let staging_table = format!("staging_{}_{}", plan.table, Uuid::new_v4().simple());
        ctx.run(create_table_sql(
            &ctx.project_id,
            &ctx.namespace,
            &staging_table,
            &plan.columns,
        ))
        .await?;
        staging_tables
            .lock()
            .expect("staging table list poisoned")
            .push(staging_table.clone());

        ctx.run(load_sql(
            &ctx.project_id,
            &ctx.namespace,
            &staging_table,
            &plan.load_file_locations,
        ))
        .await?;

        ctx.run(merge_sql(
            &ctx.project_id,
            &ctx.namespace,
            &plan.table,
            &staging_table,
            &plan.sorted_columns,
            &plan.primary_key,
        ))
        .await?;

        Ok(())
    }
}

impl Warehouse for BigQueryWarehouse {
    async fn ensure_namespace(&self) -> EgressResult<()> {
        self.ctx
            .run(create_dataset_sql(&self.ctx.project_id, &self.ctx.namespace))
            .await
    }

    async fn migrate(&self, diff: &SchemaDiff) -> EgressResult<()> {
        for (table, columns) in &diff.new_tables {
            self.ctx
                .run(create_table_sql(
                    &self.ctx.project_id,
                    &self.ctx.namespace,
                    table,
                    columns,
                ))
                .await?;
        }

        for (table, columns) in &diff.added_columns {
            for (column, column_type) in columns {
                self.ctx
                    .run(add_column_sql(
                        &self.ctx.project_id,
                        &self.ctx.namespace,
                        table,
                        column,
                        column_type,
                    ))
                    .await?;
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

        let created: Vec<String> = staging_tables
            .lock()
            .expect("staging table list poisoned")
            .drain(..)
            .collect();
        for staging_table in created {
            let sql = drop_table_sql(&self.ctx.project_id, &self.ctx.namespace, &staging_table);
            if let Err(err) = self.ctx.run(sql).await {
                warn!("failed to drop staging table {staging_table}: {err}");
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Builds [`BigQueryWarehouse`] connections from destination configuration.
#[derive(Clone)]
pub struct BigQueryFactory;

impl BigQueryFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BigQueryFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WarehouseFactory for BigQueryFactory {
    type Warehouse = BigQueryWarehouse;

    async fn connect(&self, binding: &Binding, namespace: &str) -> EgressResult<BigQueryWarehouse> {
        let connection = binding.destination.warehouse_config()?;

        let project_id = connection.project.clone().ok_or_else(|| {
            crate::egress_error!(
                ErrorKind::ConfigError,
                "BigQuery destination has no project id"
            )
        })?;
        let service_account_key = connection.credentials.clone().ok_or_else(|| {
            crate::egress_error!(
                ErrorKind::ConfigError,
                "BigQuery destination has no service account key"
            )
        })?;

        let key = parse_service_account_key(service_account_key).map_err(|err| {
            crate::egress_error!(
                ErrorKind::ConfigError,
                "Invalid BigQuery service account key",
                err
            )
        })?;
        let client = Client::from_service_account_key(key, false)
            .await
            .map_err(|err| {
                crate::egress_error!(
                    ErrorKind::WarehouseConnectionFailed,
                    "Failed to connect to BigQuery",
                    err
                )
            })?;

        Ok(BigQueryWarehouse {
            ctx: Arc::new(BigQueryContext {
                client,
                project_id,
                namespace: namespace.to_owned(),
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
        assert_eq!(map_type("boolean"), "bool");
        assert_eq!(map_type("int"), "int64");
        assert_eq!(map_type("bigint"), "int64");
        assert_eq!(map_type("float"), "float64");
        assert_eq!(map_type("string"), "string");
        assert_eq!(map_type("datetime"), "timestamp");
    }

    #[test]
    fn create_table_quotes_identifiers() {
        let sql = create_table_sql("proj", "ns", "tracks", &columns(&[("a", "int")]));
        assert_eq!(
            sql,
            "create table if not exists `proj.ns.tracks` ( `a` int64 )"
        );
    }

    #[test]
    fn add_column_is_idempotent() {
        let sql = add_column_sql("proj", "ns", "tracks", "b", "string");
        assert_eq!(
            sql,
            "alter table `proj.ns.tracks` add column if not exists `b` string"
        );
    }

    #[test]
    fn load_lists_every_uri() {
        let sql = load_sql(
            "proj",
            "ns",
            "staging_tracks_x",
            &["gs://b/one.json.gz".to_string(), "gs://b/two.json.gz".to_string()],
        );
        assert_eq!(
            sql,
            "load data into `proj.ns.staging_tracks_x` from files \
             (format = 'JSON', uris = ['gs://b/one.json.gz', 'gs://b/two.json.gz'])"
        );
    }

    #[test]
    fn merge_dedupes_on_primary_key() {
        let sql = merge_sql(
            "proj",
            "ns",
            "tracks",
            "staging_tracks_x",
            &["a".to_string(), "id".to_string()],
            "id",
        );
        assert!(sql.contains("row_number() over (partition by id order by received_at asc)"));
        assert!(sql.contains("on _target.id = _staged.id"));
        assert!(sql.contains("when matched then update set `a` = _staged.`a`, `id` = _staged.`id`"));
        assert!(sql.contains("when not matched then insert (`a`, `id`) values (_staged.`a`, _staged.`id`)"));
    }
}
