//! Object-storage access for batches, staging files, load files and
//! manifests.
//!
//! Wraps the `object_store` crate: S3 and GCS for production, a process-wide
//! in-memory registry for development and tests. Clients are cheap to build
//! and built per upload, since bucket and credentials vary per destination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};

use egress_config::shared::StorageSettings;

use crate::error::{EgressError, EgressResult, ErrorKind};
use crate::types::DestinationStorageConfig;

/// Object-storage providers the pipeline can write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageProvider {
    #[serde(rename = "S3")]
    S3,
    #[serde(rename = "GCS")]
    Gcs,
    #[serde(rename = "MEMORY")]
    Memory,
}

impl StorageProvider {
    /// URL scheme used in stored object locations.
    pub fn scheme(&self) -> &'static str {
        match self {
            StorageProvider::S3 => "s3",
            StorageProvider::Gcs => "gs",
            StorageProvider::Memory => "mem",
        }
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Full object URL, e.g. `s3://bucket/prefix/file.json.gz`.
    pub location: String,
    /// Object key within the bucket.
    pub key: String,
}

/// A handle to one bucket of one provider.
#[derive(Clone)]
pub struct ObjectStoreClient {
    provider: StorageProvider,
    bucket: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreClient {
    pub fn provider(&self) -> StorageProvider {
        self.provider
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Uploads `data` under the key formed by joining `key_parts` with `/`.
    pub async fn upload(&self, data: Vec<u8>, key_parts: &[&str]) -> EgressResult<StoredObject> {
        let key = key_parts.join("/");
        let path = Path::from(key.as_str());

        self.store.put(&path, PutPayload::from(data)).await?;

        Ok(StoredObject {
            location: format!("{}://{}/{}", self.provider.scheme(), self.bucket, key),
            key,
        })
    }

    /// Downloads the object stored under `key`.
    pub async fn download(&self, key: &str) -> EgressResult<Vec<u8>> {
        let path = Path::from(key);
        let result = self.store.get(&path).await?;
        let bytes = result.bytes().await?;
        Ok(bytes.to_vec())
    }

    /// Lists object keys under a prefix.
    pub async fn list_keys(&self, prefix: &str) -> EgressResult<Vec<String>> {
        let prefix = Path::from(prefix);
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        Ok(objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect())
    }
}

/// Factory for object-store clients.
///
/// In cloud mode, clients talk to real S3/GCS buckets using per-destination
/// credentials, falling back to the platform defaults from
/// [`StorageSettings`]. In memory mode, every provider resolves to a shared
/// per-bucket [`InMemory`] store so tests observe the routers' writes.
#[derive(Clone)]
pub struct Storage {
    settings: Arc<StorageSettings>,
    memory: Option<Arc<Mutex<HashMap<String, Arc<InMemory>>>>>,
}

impl Storage {
    /// Cloud-backed storage using the given platform settings.
    pub fn new(settings: StorageSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            memory: None,
        }
    }

    /// In-memory storage for development and tests.
    pub fn in_memory() -> Self {
        Self {
            settings: Arc::new(StorageSettings::default()),
            memory: Some(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    /// Builds a client for one bucket of one provider.
    pub fn client(
        &self,
        provider: StorageProvider,
        bucket: &str,
        config: &DestinationStorageConfig,
    ) -> EgressResult<ObjectStoreClient> {
        if let Some(registry) = &self.memory {
            let mut registry = registry.lock().expect("memory store registry poisoned");
            let store = registry
                .entry(bucket.to_owned())
                .or_insert_with(|| Arc::new(InMemory::new()))
                .clone();

            return Ok(ObjectStoreClient {
                provider,
                bucket: bucket.to_owned(),
                store,
            });
        }

        let store: Arc<dyn ObjectStore> = match provider {
            StorageProvider::S3 => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                if let Some(access_key_id) = config
                    .access_key_id
                    .as_deref()
                    .or_else(|| self.settings.aws_access_key_id.as_ref().map(|key| key.expose()))
                {
                    builder = builder.with_access_key_id(access_key_id);
                }
                if let Some(secret) = config.access_key.as_deref().or_else(|| {
                    self.settings
                        .aws_secret_access_key
                        .as_ref()
                        .map(|key| key.expose())
                }) {
                    builder = builder.with_secret_access_key(secret);
                }
                Arc::new(builder.build()?)
            }
            StorageProvider::Gcs => {
                let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
                if let Some(key) = config.credentials.as_deref().or_else(|| {
                    self.settings
                        .gcp_service_account_key
                        .as_ref()
                        .map(|key| key.expose())
                }) {
                    builder = builder.with_service_account_key(key);
                }
                Arc::new(builder.build()?)
            }
            StorageProvider::Memory => {
                return Err(crate::egress_error!(
                    ErrorKind::ConfigError,
                    "Memory storage provider requires in-memory mode"
                ));
            }
        };

        Ok(ObjectStoreClient {
            provider,
            bucket: bucket.to_owned(),
            store,
        })
    }

    /// Client for the shared warehouse staging bucket.
    pub fn staging_client(&self, provider: StorageProvider) -> EgressResult<ObjectStoreClient> {
        self.client(
            provider,
            &self.settings.staging_bucket,
            &DestinationStorageConfig::default(),
        )
    }
}
