use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the batch router's main loop and worker pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct BatchRouterSettings {
    /// Maximum number of jobs selected from the queue per scheduling pass
    /// and destination.
    pub job_query_batch_size: usize,
    /// Number of batch upload workers.
    pub workers: usize,
    /// Seconds to sleep between scheduling passes.
    pub main_loop_sleep_secs: u64,
}

impl BatchRouterSettings {
    /// Sleep between scheduling passes.
    pub fn main_loop_sleep(&self) -> Duration {
        Duration::from_secs(self.main_loop_sleep_secs)
    }
}

impl Default for BatchRouterSettings {
    fn default() -> Self {
        Self {
            job_query_batch_size: 100_000,
            workers: 8,
            main_loop_sleep_secs: 5,
        }
    }
}
