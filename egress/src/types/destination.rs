use serde::{Deserialize, Serialize};

use crate::error::{EgressError, EgressResult, ErrorKind};
use crate::storage::StorageProvider;

/// Supported destination types.
///
/// Raw object-storage destinations receive newline-delimited batches
/// directly; warehouse destinations go through the staging and load-file
/// pipeline first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationType {
    #[serde(rename = "S3")]
    S3,
    #[serde(rename = "GCS")]
    Gcs,
    #[serde(rename = "RS")]
    Redshift,
    #[serde(rename = "BQ")]
    BigQuery,
}

impl DestinationType {
    /// All destination types handled by the batch router.
    pub const ALL: [DestinationType; 4] = [
        DestinationType::S3,
        DestinationType::Gcs,
        DestinationType::Redshift,
        DestinationType::BigQuery,
    ];

    /// Wire name of this destination type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationType::S3 => "S3",
            DestinationType::Gcs => "GCS",
            DestinationType::Redshift => "RS",
            DestinationType::BigQuery => "BQ",
        }
    }

    /// Returns whether batches for this destination go straight to object
    /// storage.
    pub fn is_object_storage(&self) -> bool {
        matches!(self, DestinationType::S3 | DestinationType::Gcs)
    }

    /// Returns whether this destination is a warehouse.
    pub fn is_warehouse(&self) -> bool {
        matches!(self, DestinationType::Redshift | DestinationType::BigQuery)
    }

    /// The object-storage provider backing this destination type: raw
    /// destinations upload to themselves, warehouses stage through their
    /// cloud's store.
    pub fn object_storage_provider(&self) -> StorageProvider {
        match self {
            DestinationType::S3 | DestinationType::Redshift => StorageProvider::S3,
            DestinationType::Gcs | DestinationType::BigQuery => StorageProvider::Gcs,
        }
    }
}

impl std::str::FromStr for DestinationType {
    type Err = EgressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S3" => Ok(DestinationType::S3),
            "GCS" => Ok(DestinationType::Gcs),
            "RS" => Ok(DestinationType::Redshift),
            "BQ" => Ok(DestinationType::BigQuery),
            other => Err(crate::egress_error!(
                ErrorKind::ConfigError,
                "Unknown destination type",
                other
            )),
        }
    }
}

impl std::fmt::Display for DestinationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event source as delivered by the configuration stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

/// A configured destination of a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    pub enabled: bool,
    pub destination_type: DestinationType,
    /// Destination-specific configuration (bucket, credentials, warehouse
    /// connection parameters).
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Destination {
    /// Parses the object-storage part of the destination configuration.
    pub fn storage_config(&self) -> EgressResult<DestinationStorageConfig> {
        Ok(serde_json::from_value(self.config.clone())?)
    }

    /// Parses the warehouse connection part of the destination configuration.
    pub fn warehouse_config(&self) -> EgressResult<WarehouseConnectionConfig> {
        Ok(serde_json::from_value(self.config.clone())?)
    }
}

/// A full topology snapshot from the configuration stream. Each snapshot
/// replaces the previous one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sources {
    #[serde(default)]
    pub sources: Vec<Source>,
}

/// An enabled `(source, destination)` pair.
#[derive(Debug, Clone)]
pub struct Binding {
    pub source: Source,
    pub destination: Destination,
}

impl Binding {
    /// Key identifying this binding in the in-progress registry.
    pub fn in_progress_key(&self) -> String {
        format!("{}_{}", self.source.id, self.destination.id)
    }

    pub fn destination_type(&self) -> DestinationType {
        self.destination.destination_type
    }
}

/// Object-storage fields of a destination configuration.
///
/// Field names follow the wire casing of the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationStorageConfig {
    #[serde(rename = "bucketName")]
    pub bucket_name: String,
    #[serde(rename = "accessKeyID")]
    pub access_key_id: Option<String>,
    #[serde(rename = "accessKey")]
    pub access_key: Option<String>,
    #[serde(rename = "region")]
    pub region: Option<String>,
    /// GCP service account key (JSON), for GCS-backed destinations.
    #[serde(rename = "credentials")]
    pub credentials: Option<String>,
}

/// Warehouse connection fields of a destination configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConnectionConfig {
    pub host: String,
    pub port: String,
    pub database: String,
    pub user: String,
    pub password: String,
    /// GCP project id, for BigQuery destinations.
    pub project: Option<String>,
    /// GCP service account key (JSON), for BigQuery destinations.
    pub credentials: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_type_wire_names() {
        assert_eq!(DestinationType::S3.as_str(), "S3");
        assert_eq!(DestinationType::Gcs.as_str(), "GCS");
        assert_eq!(DestinationType::Redshift.as_str(), "RS");
        assert_eq!(DestinationType::BigQuery.as_str(), "BQ");

        let parsed: DestinationType = serde_json::from_value(serde_json::json!("RS")).unwrap();
        assert_eq!(parsed, DestinationType::Redshift);
    }

    #[test]
    fn destination_type_classification() {
        assert!(DestinationType::S3.is_object_storage());
        assert!(DestinationType::Gcs.is_object_storage());
        assert!(!DestinationType::Redshift.is_object_storage());
        assert!(DestinationType::Redshift.is_warehouse());
        assert!(DestinationType::BigQuery.is_warehouse());
    }

    #[test]
    fn warehouse_staging_providers() {
        assert_eq!(
            DestinationType::Redshift.object_storage_provider(),
            StorageProvider::S3
        );
        assert_eq!(
            DestinationType::BigQuery.object_storage_provider(),
            StorageProvider::Gcs
        );
    }

    #[test]
    fn binding_in_progress_key() {
        let binding = Binding {
            source: Source {
                id: "src1".into(),
                name: "Source One".into(),
                enabled: true,
                destinations: vec![],
            },
            destination: Destination {
                id: "dst1".into(),
                enabled: true,
                destination_type: DestinationType::S3,
                config: serde_json::json!({}),
            },
        };
        assert_eq!(binding.in_progress_key(), "src1_dst1");
    }

    #[test]
    fn storage_config_parses_wire_casing() {
        let destination = Destination {
            id: "dst1".into(),
            enabled: true,
            destination_type: DestinationType::S3,
            config: serde_json::json!({
                "bucketName": "my-bucket",
                "accessKeyID": "AKIA",
                "accessKey": "secret"
            }),
        };

        let config = destination.storage_config().unwrap();
        assert_eq!(config.bucket_name, "my-bucket");
        assert_eq!(config.access_key_id.as_deref(), Some("AKIA"));
        assert_eq!(config.access_key.as_deref(), Some("secret"));
    }
}
