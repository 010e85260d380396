//! In-memory warehouse dialect for development and tests.
//!
//! Records applied migrations and export plans instead of talking to a real
//! destination, and can be primed to fail the next migration or export.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{EgressError, EgressResult, ErrorKind};
use crate::types::{Binding, SchemaDiff, WarehouseSchema};
use crate::warehouse::base::{ExportPlan, Warehouse, WarehouseFactory};

#[derive(Debug, Default)]
struct State {
    namespaces: HashSet<String>,
    tables: HashMap<String, WarehouseSchema>,
    exports: Vec<ExportPlan>,
    fail_migrate: Option<String>,
    fail_export: Option<String>,
}

/// Shared state behind every [`MemoryWarehouse`] built from the same
/// instance, so tests observe what the pipeline applied.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouseState {
    inner: Arc<Mutex<State>>,
}

impl MemoryWarehouseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a warehouse handle bound to a namespace.
    pub fn warehouse(&self, namespace: &str) -> MemoryWarehouse {
        MemoryWarehouse {
            inner: self.inner.clone(),
            namespace: namespace.to_owned(),
        }
    }

    /// Tables applied to a namespace so far.
    pub fn tables(&self, namespace: &str) -> WarehouseSchema {
        let inner = self.inner.lock().unwrap();
        inner.tables.get(namespace).cloned().unwrap_or_default()
    }

    /// Namespaces created so far.
    pub fn namespaces(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.namespaces.iter().cloned().collect()
    }

    /// Export plans received so far.
    pub fn exports(&self) -> Vec<ExportPlan> {
        self.inner.lock().unwrap().exports.clone()
    }

    /// Makes the next migration fail with `message`.
    pub fn fail_next_migrate(&self, message: &str) {
        self.inner.lock().unwrap().fail_migrate = Some(message.to_owned());
    }

    /// Makes the next export fail with `message`.
    pub fn fail_next_export(&self, message: &str) {
        self.inner.lock().unwrap().fail_export = Some(message.to_owned());
    }
}

/// One namespace-bound connection to the in-memory warehouse.
#[derive(Debug, Clone)]
pub struct MemoryWarehouse {
    inner: Arc<Mutex<State>>,
    namespace: String,
}

impl Warehouse for MemoryWarehouse {
    async fn ensure_namespace(&self) -> EgressResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.namespaces.insert(self.namespace.clone());
        Ok(())
    }

    async fn migrate(&self, diff: &SchemaDiff) -> EgressResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(message) = inner.fail_migrate.take() {
            return Err(crate::egress_error!(
                ErrorKind::WarehouseQueryFailed,
                "Schema migration failed",
                message
            ));
        }

        let tables = inner.tables.entry(self.namespace.clone()).or_default();
        for (table, columns) in &diff.new_tables {
            tables.insert(table.clone(), columns.clone());
        }
        for (table, columns) in &diff.added_columns {
            let table_schema = tables.entry(table.clone()).or_default();
            for (column, column_type) in columns {
                table_schema
                    .entry(column.clone())
                    .or_insert_with(|| column_type.clone());
            }
        }

        Ok(())
    }

    async fn export(&self, plan: &ExportPlan) -> EgressResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(message) = inner.fail_export.take() {
            return Err(crate::egress_error!(
                ErrorKind::WarehouseQueryFailed,
                "Export failed",
                message
            ));
        }

        inner.exports.push(plan.clone());
        Ok(())
    }
}

/// Factory handing out [`MemoryWarehouse`] connections.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouseFactory {
    state: MemoryWarehouseState,
}

impl MemoryWarehouseFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: MemoryWarehouseState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &MemoryWarehouseState {
        &self.state
    }
}

impl WarehouseFactory for MemoryWarehouseFactory {
    type Warehouse = MemoryWarehouse;

    async fn connect(&self, _binding: &Binding, namespace: &str) -> EgressResult<MemoryWarehouse> {
        Ok(self.state.warehouse(namespace))
    }
}
