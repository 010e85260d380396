use std::future::Future;

use crate::error::EgressResult;
use crate::types::{Binding, SchemaDiff, TableColumns};

/// Tables whose merge key differs from the default.
const PRIMARY_KEY_OVERRIDES: &[(&str, &str)] = &[("users", "id"), ("identifies", "id")];

/// Merge key for a destination table.
pub fn primary_key(table: &str) -> &'static str {
    PRIMARY_KEY_OVERRIDES
        .iter()
        .find(|(name, _)| *name == table)
        .map(|(_, key)| *key)
        .unwrap_or("id")
}

/// Everything a dialect needs to export one upload: per table, the columns,
/// their load order, the merge key and the load-file locations.
#[derive(Debug, Clone)]
pub struct ExportPlan {
    pub upload_id: i64,
    pub namespace: String,
    pub tables: Vec<TableExportPlan>,
}

#[derive(Debug, Clone)]
pub struct TableExportPlan {
    pub table: String,
    pub columns: TableColumns,
    /// Column order of the load files: lexicographic.
    pub sorted_columns: Vec<String>,
    pub primary_key: String,
    pub load_file_locations: Vec<String>,
}

/// Capability set of a warehouse dialect.
///
/// The upload driver owns every status transition; implementations only
/// talk to the destination. Dialect SQL never leaks out of them.
pub trait Warehouse: Send + Sync {
    /// Creates the destination namespace if absent.
    fn ensure_namespace(&self) -> impl Future<Output = EgressResult<()>> + Send;

    /// Applies a schema diff: create new tables, add new columns.
    /// Column-already-exists conflicts are tolerated.
    fn migrate(&self, diff: &SchemaDiff) -> impl Future<Output = EgressResult<()>> + Send;

    /// Loads every table of the plan through a staging table and merges on
    /// the primary key, keeping the record with the latest `received_at`.
    fn export(&self, plan: &ExportPlan) -> impl Future<Output = EgressResult<()>> + Send;
}

/// Builds per-upload [`Warehouse`] connections for one destination type.
pub trait WarehouseFactory: Clone + Send + Sync + 'static {
    type Warehouse: Warehouse;

    fn connect(
        &self,
        binding: &Binding,
        namespace: &str,
    ) -> impl Future<Output = EgressResult<Self::Warehouse>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_key_defaults_to_id() {
        assert_eq!(primary_key("tracks"), "id");
        assert_eq!(primary_key("users"), "id");
        assert_eq!(primary_key("identifies"), "id");
    }
}
