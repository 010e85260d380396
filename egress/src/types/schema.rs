use std::collections::BTreeMap;

use crate::error::{EgressError, EgressResult, ErrorKind};
use crate::types::Job;

/// Column name → logical type for one destination table.
pub type TableColumns = BTreeMap<String, String>;

/// Table name → columns for one warehouse destination.
pub type WarehouseSchema = BTreeMap<String, TableColumns>;

/// Difference between the persisted current schema and an upload's schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaDiff {
    /// Tables absent from the current schema, with their full column sets.
    pub new_tables: WarehouseSchema,
    /// Columns to add to tables that already exist.
    pub added_columns: WarehouseSchema,
    /// The merged schema after applying the diff.
    pub updated: WarehouseSchema,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.new_tables.is_empty() && self.added_columns.is_empty()
    }
}

/// Extracts the batch-union schema of a set of warehouse-bound jobs.
///
/// Every job must carry `metadata.table` and `metadata.columns`; a job
/// without them is a malformed payload. Type conflicts resolve
/// first-seen-wins.
pub fn schema_from_jobs(jobs: &[Job]) -> EgressResult<WarehouseSchema> {
    let mut schema = WarehouseSchema::new();

    for job in jobs {
        let metadata = job.payload.get("metadata").ok_or_else(|| {
            crate::egress_error!(
                ErrorKind::InvalidData,
                "Malformed warehouse payload",
                format!("job {} has no metadata object", job.id)
            )
        })?;
        let table = metadata
            .get("table")
            .and_then(|table| table.as_str())
            .ok_or_else(|| {
                crate::egress_error!(
                    ErrorKind::InvalidData,
                    "Malformed warehouse payload",
                    format!("job {} has no metadata.table", job.id)
                )
            })?;
        let columns = metadata
            .get("columns")
            .and_then(|columns| columns.as_object())
            .ok_or_else(|| {
                crate::egress_error!(
                    ErrorKind::InvalidData,
                    "Malformed warehouse payload",
                    format!("job {} has no metadata.columns", job.id)
                )
            })?;

        let table_schema = schema.entry(table.to_owned()).or_default();
        for (column, column_type) in columns {
            let Some(column_type) = column_type.as_str() else {
                return Err(crate::egress_error!(
                    ErrorKind::InvalidData,
                    "Malformed warehouse payload",
                    format!("job {} column {} has a non-string type", job.id, column)
                ));
            };
            table_schema
                .entry(column.clone())
                .or_insert_with(|| column_type.to_owned());
        }
    }

    Ok(schema)
}

/// Merges per-file schemas into the union schema of an upload.
///
/// Files are visited in order; type conflicts resolve first-seen-wins.
pub fn consolidate_schemas<'a, I>(schemas: I) -> WarehouseSchema
where
    I: IntoIterator<Item = &'a WarehouseSchema>,
{
    let mut consolidated = WarehouseSchema::new();

    for schema in schemas {
        for (table, columns) in schema {
            let table_schema = consolidated.entry(table.clone()).or_default();
            for (column, column_type) in columns {
                table_schema
                    .entry(column.clone())
                    .or_insert_with(|| column_type.clone());
            }
        }
    }

    consolidated
}

/// Parses the JSON `schema` column of a staging-file or upload row.
pub fn schema_from_value(value: &serde_json::Value) -> EgressResult<WarehouseSchema> {
    serde_json::from_value(value.clone()).map_err(|err| {
        crate::egress_error!(
            ErrorKind::InvalidData,
            "Malformed schema column",
            err.to_string()
        )
    })
}

/// Diffs the current schema against an upload's schema.
///
/// Existing column types are never changed: a type conflict keeps the
/// current type.
pub fn schema_diff(current: &WarehouseSchema, target: &WarehouseSchema) -> SchemaDiff {
    let mut diff = SchemaDiff {
        updated: current.clone(),
        ..Default::default()
    };

    for (table, columns) in target {
        match current.get(table) {
            None => {
                diff.new_tables.insert(table.clone(), columns.clone());
                diff.updated.insert(table.clone(), columns.clone());
            }
            Some(existing) => {
                let mut added = TableColumns::new();
                for (column, column_type) in columns {
                    if !existing.contains_key(column) {
                        added.insert(column.clone(), column_type.clone());
                    }
                }
                if !added.is_empty() {
                    diff.updated
                        .get_mut(table)
                        .expect("table present in updated schema")
                        .extend(added.clone());
                    diff.added_columns.insert(table.clone(), added);
                }
            }
        }
    }

    diff
}

/// Lexicographically sorted column names per table.
///
/// Load files present columns in exactly this order.
pub fn sorted_table_columns(schema: &WarehouseSchema) -> BTreeMap<String, Vec<String>> {
    schema
        .iter()
        .map(|(table, columns)| {
            let mut names: Vec<String> = columns.keys().cloned().collect();
            names.sort();
            (table.clone(), names)
        })
        .collect()
}

/// Derives the destination namespace from a source name: lowercase
/// snake_case.
pub fn namespace_from_source_name(name: &str) -> String {
    let mut namespace = String::with_capacity(name.len());
    let mut prev_is_separator = true;

    for ch in name.chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() && !prev_is_separator && !namespace.ends_with('_') {
                namespace.push('_');
            }
            namespace.extend(ch.to_lowercase());
            prev_is_separator = false;
        } else if !prev_is_separator {
            namespace.push('_');
            prev_is_separator = true;
        }
    }

    namespace.trim_end_matches('_').to_owned()
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
    fn consolidation_unions_tables_and_columns() {
        let first: WarehouseSchema = [("tracks".to_string(), columns(&[("a", "int")]))].into();
        let second: WarehouseSchema = [
            ("tracks".to_string(), columns(&[("b", "string")])),
            ("users".to_string(), columns(&[("id", "string")])),
        ]
        .into();

        let consolidated = consolidate_schemas([&first, &second]);
        assert_eq!(
            consolidated["tracks"],
            columns(&[("a", "int"), ("b", "string")])
        );
        assert_eq!(consolidated["users"], columns(&[("id", "string")]));
    }

    #[test]
    fn consolidation_is_first_seen_wins() {
        let first: WarehouseSchema = [("tracks".to_string(), columns(&[("a", "int")]))].into();
        let second: WarehouseSchema = [("tracks".to_string(), columns(&[("a", "string")]))].into();

        let consolidated = consolidate_schemas([&first, &second]);
        assert_eq!(consolidated["tracks"]["a"], "int");
    }

    #[test]
    fn schema_from_jobs_unions_batch() {
        let jobs = vec![
            Job {
                id: 1,
                payload: serde_json::json!({
                    "messageId": "m1",
                    "metadata": {"table": "tracks", "columns": {"a": "int"}},
                    "data": {"a": 1}
                }),
                attempt: 0,
            },
            Job {
                id: 2,
                payload: serde_json::json!({
                    "messageId": "m2",
                    "metadata": {"table": "tracks", "columns": {"a": "string", "b": "string"}},
                    "data": {"a": "x", "b": "y"}
                }),
                attempt: 0,
            },
        ];

        let schema = schema_from_jobs(&jobs).unwrap();
        // First-seen type for `a` survives.
        assert_eq!(schema["tracks"]["a"], "int");
        assert_eq!(schema["tracks"]["b"], "string");
    }

    #[test]
    fn schema_from_jobs_rejects_missing_metadata() {
        let jobs = vec![Job {
            id: 1,
            payload: serde_json::json!({"messageId": "m1"}),
            attempt: 0,
        }];

        let err = schema_from_jobs(&jobs).unwrap_err();
        assert!(err.kind().is_fatal());
    }

    #[test]
    fn diff_reports_new_tables_and_added_columns() {
        let current: WarehouseSchema = [("tracks".to_string(), columns(&[("a", "int")]))].into();
        let target: WarehouseSchema = [
            (
                "tracks".to_string(),
                columns(&[("a", "int"), ("b", "string")]),
            ),
            ("users".to_string(), columns(&[("id", "string")])),
        ]
        .into();

        let diff = schema_diff(&current, &target);
        assert_eq!(diff.new_tables.len(), 1);
        assert!(diff.new_tables.contains_key("users"));
        assert_eq!(diff.added_columns["tracks"], columns(&[("b", "string")]));
        assert_eq!(
            diff.updated["tracks"],
            columns(&[("a", "int"), ("b", "string")])
        );
    }

    #[test]
    fn diff_keeps_current_type_on_conflict() {
        let current: WarehouseSchema = [("tracks".to_string(), columns(&[("a", "int")]))].into();
        let target: WarehouseSchema = [("tracks".to_string(), columns(&[("a", "string")]))].into();

        let diff = schema_diff(&current, &target);
        assert!(diff.is_empty());
        assert_eq!(diff.updated["tracks"]["a"], "int");
    }

    #[test]
    fn sorted_columns_are_lexicographic() {
        let schema: WarehouseSchema = [(
            "tracks".to_string(),
            columns(&[("b", "int"), ("a", "string"), ("c", "float")]),
        )]
        .into();

        let sorted = sorted_table_columns(&schema);
        assert_eq!(sorted["tracks"], vec!["a", "b", "c"]);
    }

    #[test]
    fn namespace_is_snake_cased() {
        assert_eq!(namespace_from_source_name("My Shop Events"), "my_shop_events");
        assert_eq!(namespace_from_source_name("webApp"), "web_app");
        assert_eq!(namespace_from_source_name("prod-site"), "prod_site");
        assert_eq!(namespace_from_source_name("API"), "api");
    }
}
