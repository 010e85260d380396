use serde::{Deserialize, Serialize};

use crate::SerializableSecretString;

/// Object-storage configuration shared by the batch router and the warehouse
/// uploader.
///
/// Credentials here are the platform-level defaults used for the shared
/// staging bucket and for crash recovery; per-destination credentials from
/// the destination config take precedence where present.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct StorageSettings {
    /// Shared bucket receiving warehouse staging files.
    pub staging_bucket: String,
    /// Key prefix for raw destination uploads.
    pub raw_folder: String,
    /// Key prefix for warehouse staging uploads.
    pub warehouse_folder: String,
    /// Key prefix for per-table load files.
    pub load_objects_folder: String,
    /// Key prefix for warehouse load manifests.
    pub manifest_folder: String,
    /// Region used for warehouse bulk loads when the object location does
    /// not carry one.
    pub default_copy_region: String,
    /// Default AWS access key id.
    pub aws_access_key_id: Option<SerializableSecretString>,
    /// Default AWS secret access key.
    pub aws_secret_access_key: Option<SerializableSecretString>,
    /// Default GCP service account key (JSON).
    pub gcp_service_account_key: Option<SerializableSecretString>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            staging_bucket: "egress-warehouse-staging".to_owned(),
            raw_folder: "raw-dest-logs".to_owned(),
            warehouse_folder: "warehouse-staging".to_owned(),
            load_objects_folder: "warehouse-load-objects".to_owned(),
            manifest_folder: "warehouse-manifests".to_owned(),
            default_copy_region: "us-east-1".to_owned(),
            aws_access_key_id: None,
            aws_secret_access_key: None,
            gcp_service_account_key: None,
        }
    }
}
