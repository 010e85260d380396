use serde::{Deserialize, Serialize};

use crate::shared::{
    BatchRouterSettings, PgConnectionConfig, StorageSettings, WarehouseSettings,
};

/// Top-level configuration for an egress service instance.
///
/// This is the shape deserialized by [`crate::load_config`] from the YAML
/// configuration files and `APP_*` environment overrides.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServiceSettings {
    /// Batch router settings.
    #[serde(default)]
    pub batch_router: BatchRouterSettings,
    /// Warehouse uploader settings.
    #[serde(default)]
    pub warehouse: WarehouseSettings,
    /// Object-storage settings.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Warehouse catalog database connection.
    pub catalog: PgConnectionConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings: ServiceSettings = serde_json::from_value(serde_json::json!({
            "catalog": {
                "host": "localhost",
                "port": 5432,
                "name": "jobs",
                "username": "egress",
                "password": "secret",
                "require_ssl": false
            }
        }))
        .unwrap();

        assert_eq!(settings.batch_router.job_query_batch_size, 100_000);
        assert_eq!(settings.batch_router.workers, 8);
        assert_eq!(settings.batch_router.main_loop_sleep_secs, 5);
        assert_eq!(settings.warehouse.upload_sleep_secs, 1800);
        assert_eq!(settings.warehouse.staging_files_batch_size, 20);
        assert_eq!(settings.storage.default_copy_region, "us-east-1");
    }
}
