mod common;

use std::collections::HashMap;

use egress::catalog::MemoryCatalog;
use egress::compression::{gunzip, gzip};
use egress::queue::JobQueue;
use egress::queue::memory::MemoryJobQueue;
use egress::router::BatchRouter;
use egress::storage::{ObjectStoreClient, Storage, StorageProvider};
use egress::types::{DestinationStorageConfig, DestinationType, JobState, JournalOpType};
use egress_postgres::types::StagingFileStatus;
use egress_telemetry::init_test_tracing;
use tokio::sync::mpsc;

use common::{fast_batch_router_settings, raw_payload, single_binding, wait_until, warehouse_payload};

/// Downloads every object under `prefix` and collects the message ids of
/// their newline-delimited records, per object.
async fn message_ids_per_object(
    client: &ObjectStoreClient,
    prefix: &str,
) -> HashMap<String, Vec<String>> {
    let mut ids = HashMap::new();
    for key in client.list_keys(prefix).await.unwrap() {
        let data = gunzip(&client.download(&key).await.unwrap()).unwrap();
        let mut object_ids = Vec::new();
        for line in data.split(|byte| *byte == b'\n') {
            if line.is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_slice(line).unwrap();
            object_ids.push(value["messageId"].as_str().unwrap().to_owned());
        }
        ids.insert(key, object_ids);
    }
    ids
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_batches_reach_object_storage_and_jobs_succeed() {
    init_test_tracing();

    let queue = MemoryJobQueue::new();
    let catalog = MemoryCatalog::new();
    let storage = Storage::in_memory();

    for i in 0..5 {
        queue.push_unprocessed("src1", DestinationType::S3, raw_payload(&format!("one-{i}")));
        queue.push_unprocessed("src2", DestinationType::S3, raw_payload(&format!("two-{i}")));
    }

    let (config_tx, config_rx) = mpsc::channel(4);
    let router = BatchRouter::new(
        queue.clone(),
        catalog.clone(),
        storage.clone(),
        fast_batch_router_settings(),
        config_rx,
    )
    .await
    .unwrap();
    let handle = router.start();

    let mut snapshot = single_binding(
        "src1",
        "Source One",
        "dst1",
        DestinationType::S3,
        serde_json::json!({"bucketName": "bucket-one"}),
    );
    snapshot.sources.extend(
        single_binding(
            "src2",
            "Source Two",
            "dst2",
            DestinationType::S3,
            serde_json::json!({"bucketName": "bucket-two"}),
        )
        .sources,
    );
    config_tx.send(snapshot).await.unwrap();

    wait_until("all 10 jobs succeeded", || {
        queue.jobs_in_state(JobState::Succeeded).len() == 10
    })
    .await;

    handle.shutdown_and_wait().await.unwrap();

    assert_eq!(queue.journal_len(), 0);
    assert_eq!(
        queue.error_response(1).unwrap(),
        serde_json::json!({"success": "OK"})
    );

    let config = DestinationStorageConfig::default();
    for (bucket, source_id, prefix) in [
        ("bucket-one", "src1", "raw-dest-logs/src1"),
        ("bucket-two", "src2", "raw-dest-logs/src2"),
    ] {
        let client = storage
            .client(StorageProvider::S3, bucket, &config)
            .unwrap();
        let objects = message_ids_per_object(&client, prefix).await;
        assert_eq!(objects.len(), 1, "expected one object for {source_id}");
        let ids = objects.into_values().next().unwrap();
        assert_eq!(ids.len(), 5);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_recovery_requeues_jobs_and_dedupes_raw_events() {
    init_test_tracing();

    let queue = MemoryJobQueue::new();
    let catalog = MemoryCatalog::new();
    let storage = Storage::in_memory();
    let config = DestinationStorageConfig::default();

    // Five jobs were mid-flight when the process died.
    let mut job_ids = Vec::new();
    for i in 1..=5 {
        let id = queue.push_unprocessed("src1", DestinationType::S3, raw_payload(&format!("m{i}")));
        queue.force_state(id, JobState::Executing);
        job_ids.push(id);
    }

    // The crashed attempt got m1..m3 into the object store and left its
    // journal entry behind.
    let client = storage
        .client(StorageProvider::S3, "bucket-one", &config)
        .unwrap();
    let mut crashed_content = Vec::new();
    for i in 1..=3 {
        serde_json::to_writer(&mut crashed_content, &raw_payload(&format!("m{i}"))).unwrap();
        crashed_content.push(b'\n');
    }
    let crashed_key = "raw-dest-logs/src1/07-31-2026/crashed.json.gz";
    client
        .upload(
            gzip(&crashed_content).unwrap(),
            &["raw-dest-logs", "src1", "07-31-2026", "crashed.json.gz"],
        )
        .await
        .unwrap();
    queue
        .journal_mark_start(
            JournalOpType::RawUpload,
            serde_json::json!({
                "provider": "S3",
                "bucket": "bucket-one",
                "key": crashed_key,
            }),
        )
        .await
        .unwrap();

    let (config_tx, config_rx) = mpsc::channel(4);
    let router = BatchRouter::new(
        queue.clone(),
        catalog.clone(),
        storage.clone(),
        fast_batch_router_settings(),
        config_rx,
    )
    .await
    .unwrap();

    // Recovery moved every executing job back to failed and consumed the
    // journal entry.
    assert_eq!(queue.jobs_in_state(JobState::Failed).len(), 5);
    assert_eq!(queue.journal_len(), 0);

    let handle = router.start();
    config_tx
        .send(single_binding(
            "src1",
            "Source One",
            "dst1",
            DestinationType::S3,
            serde_json::json!({"bucketName": "bucket-one"}),
        ))
        .await
        .unwrap();

    wait_until("all 5 jobs succeeded after retry", || {
        queue.jobs_in_state(JobState::Succeeded).len() == 5
    })
    .await;

    handle.shutdown_and_wait().await.unwrap();

    assert_eq!(queue.journal_len(), 0);

    // Across the crashed object and the retry upload, every message id
    // appears exactly once.
    let objects = message_ids_per_object(&client, "raw-dest-logs/src1").await;
    assert_eq!(objects.len(), 2);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for ids in objects.values() {
        for id in ids {
            *counts.entry(id.clone()).or_default() += 1;
        }
    }
    for i in 1..=5 {
        assert_eq!(counts[&format!("m{i}")], 1, "m{i} duplicated across retry");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn warehouse_batches_record_staging_files() {
    init_test_tracing();

    let queue = MemoryJobQueue::new();
    let catalog = MemoryCatalog::new();
    let storage = Storage::in_memory();

    queue.push_unprocessed(
        "src1",
        DestinationType::Redshift,
        warehouse_payload(
            "w1",
            "tracks",
            serde_json::json!({"a": "int"}),
            serde_json::json!({"a": 1}),
        ),
    );
    queue.push_unprocessed(
        "src1",
        DestinationType::Redshift,
        warehouse_payload(
            "w2",
            "tracks",
            serde_json::json!({"a": "int", "b": "string"}),
            serde_json::json!({"a": 2, "b": "x"}),
        ),
    );

    let (config_tx, config_rx) = mpsc::channel(4);
    let router = BatchRouter::new(
        queue.clone(),
        catalog.clone(),
        storage.clone(),
        fast_batch_router_settings(),
        config_rx,
    )
    .await
    .unwrap();
    let handle = router.start();

    config_tx
        .send(single_binding(
            "src1",
            "Source One",
            "wh1",
            DestinationType::Redshift,
            serde_json::json!({"bucketName": "wh-bucket"}),
        ))
        .await
        .unwrap();

    wait_until("warehouse jobs succeeded", || {
        queue.jobs_in_state(JobState::Succeeded).len() == 2
    })
    .await;

    handle.shutdown_and_wait().await.unwrap();

    let staging_files = catalog.staging_files();
    assert_eq!(staging_files.len(), 1);
    let staging_file = &staging_files[0];
    assert_eq!(staging_file.source_id, "src1");
    assert_eq!(staging_file.destination_id, "wh1");
    assert_eq!(staging_file.status, StagingFileStatus::Waiting);
    assert!(staging_file.location.starts_with("warehouse-staging/src1/"));

    // The stored schema is the batch union.
    assert_eq!(
        staging_file.schema,
        serde_json::json!({"tracks": {"a": "int", "b": "string"}})
    );

    // The staged object is readable from the shared staging bucket.
    let staging_client = storage.staging_client(StorageProvider::S3).unwrap();
    let data = gunzip(
        &staging_client
            .download(&staging_file.location)
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(data.split(|byte| *byte == b'\n').filter(|l| !l.is_empty()).count(), 2);

    assert_eq!(queue.journal_len(), 0);
}
