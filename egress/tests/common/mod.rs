#![allow(dead_code)]

use std::time::Duration;

use egress::types::{Destination, DestinationType, Source, Sources};
use egress_config::shared::{BatchRouterSettings, WarehouseSettings};

/// Polls `condition` until it holds or the timeout elapses.
pub async fn wait_until<F>(description: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {description}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Batch router settings tuned for tests: no sleeping between passes.
pub fn fast_batch_router_settings() -> BatchRouterSettings {
    BatchRouterSettings {
        job_query_batch_size: 100_000,
        workers: 2,
        main_loop_sleep_secs: 0,
    }
}

/// Warehouse settings tuned for tests: no sleeping between passes.
pub fn fast_warehouse_settings() -> WarehouseSettings {
    WarehouseSettings {
        workers: 2,
        upload_sleep_secs: 0,
        main_loop_sleep_secs: 0,
        staging_files_batch_size: 20,
        max_upload_attempts: 8,
    }
}

/// A topology snapshot with one source and one destination.
pub fn single_binding(
    source_id: &str,
    source_name: &str,
    destination_id: &str,
    destination_type: DestinationType,
    config: serde_json::Value,
) -> Sources {
    Sources {
        sources: vec![Source {
            id: source_id.to_owned(),
            name: source_name.to_owned(),
            enabled: true,
            destinations: vec![Destination {
                id: destination_id.to_owned(),
                enabled: true,
                destination_type,
                config,
            }],
        }],
    }
}

/// A raw event payload carrying only a message id.
pub fn raw_payload(message_id: &str) -> serde_json::Value {
    serde_json::json!({
        "messageId": message_id,
        "event": "page_view",
        "properties": {"path": "/"}
    })
}

/// A warehouse-bound event payload with table metadata.
pub fn warehouse_payload(
    message_id: &str,
    table: &str,
    columns: serde_json::Value,
    data: serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "messageId": message_id,
        "metadata": {"table": table, "columns": columns},
        "data": data
    })
}
