use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the warehouse uploader's loops and worker pools.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct WarehouseSettings {
    /// Number of staging-file processing workers and load-file builder
    /// workers per destination type.
    pub workers: usize,
    /// Seconds to sleep after a full pass over all warehouse destinations.
    pub upload_sleep_secs: u64,
    /// Seconds to sleep when the uploader is disabled.
    pub main_loop_sleep_secs: u64,
    /// Maximum number of staging files consumed by a single upload.
    pub staging_files_batch_size: i64,
    /// Number of failed attempts after which a pending upload is aborted
    /// instead of resumed.
    pub max_upload_attempts: i64,
}

impl WarehouseSettings {
    /// Sleep after a full pass over all destinations.
    pub fn upload_sleep(&self) -> Duration {
        Duration::from_secs(self.upload_sleep_secs)
    }

    /// Sleep while the uploader is disabled.
    pub fn main_loop_sleep(&self) -> Duration {
        Duration::from_secs(self.main_loop_sleep_secs)
    }
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            upload_sleep_secs: 1800,
            main_loop_sleep_secs: 5,
            staging_files_batch_size: 20,
            max_upload_attempts: 8,
        }
    }
}
