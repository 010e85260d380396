//! The batch router: drains the job queue and uploads batches.
//!
//! One main-loop task selects eligible jobs per enabled binding, marks them
//! executing and hands the batch to a fixed worker pool. Workers gzip the
//! batch, journal the upload, write the object, report terminal job status
//! and (for warehouse destinations) record a staging file in the catalog.
//! Startup replays the journal to rebuild the uploaded-events cache so a
//! crash-and-retry cycle never duplicates a raw event.

pub mod progress;
pub mod subscriber;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use egress_config::shared::BatchRouterSettings;
use egress_postgres::types::NewStagingFile;

use crate::catalog::WarehouseCatalog;
use crate::compression::{gunzip, gzip};
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::{EgressError, EgressResult, ErrorKind};
use crate::queue::JobQueue;
use crate::router::progress::InProgressRegistry;
use crate::router::subscriber::{EnabledBindings, spawn_config_subscriber};
use crate::storage::{Storage, StorageProvider, StoredObject};
use crate::types::{
    Binding, DestinationStorageConfig, DestinationType, Job, JobState, JobStatus, JournalOpType,
    Sources, StorageObject, schema_from_jobs,
};

/// A batch of jobs bound for one destination.
#[derive(Debug, Clone)]
pub struct Batch {
    pub jobs: Vec<Job>,
    pub binding: Binding,
}

/// Outcome of one journalled upload attempt.
struct BatchUpload {
    op_id: i64,
    local_path: PathBuf,
    outcome: EgressResult<StoredObject>,
}

struct RouterInner<Q, C> {
    queue: Q,
    catalog: C,
    storage: Storage,
    settings: BatchRouterSettings,
    bindings: EnabledBindings,
    in_progress: InProgressRegistry,
    /// Message ids already present in the object store, seeded from orphan
    /// journal entries at startup. Read-only afterwards.
    uploaded_events: HashSet<String>,
    enabled: Arc<AtomicBool>,
}

/// The batch router. Create with [`BatchRouter::new`] (which runs crash
/// recovery) and start the loops with [`BatchRouter::start`].
pub struct BatchRouter<Q, C> {
    inner: Arc<RouterInner<Q, C>>,
    config_rx: mpsc::Receiver<Sources>,
    shutdown_tx: ShutdownTx,
}

/// Handle to a running batch router.
pub struct BatchRouterHandle {
    shutdown_tx: ShutdownTx,
    enabled: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<EgressResult<()>>>,
    subscriber: JoinHandle<()>,
}

impl BatchRouterHandle {
    /// Signals every task of the router to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.shutdown();
    }

    /// Pauses scheduling; in-flight batches still complete.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Resumes scheduling.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Waits for every task to finish, aggregating their errors.
    pub async fn wait(self) -> EgressResult<()> {
        let mut errors = Vec::new();

        for task in self.tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(err) => errors.push(crate::egress_error!(
                    ErrorKind::InvalidState,
                    "Router task panicked",
                    err
                )),
            }
        }
        if let Err(err) = self.subscriber.await {
            errors.push(crate::egress_error!(
                ErrorKind::InvalidState,
                "Config subscriber panicked",
                err
            ));
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    /// Signals shutdown and waits for termination.
    pub async fn shutdown_and_wait(self) -> EgressResult<()> {
        self.shutdown();
        self.wait().await
    }
}

impl<Q, C> BatchRouter<Q, C>
where
    Q: JobQueue,
    C: WarehouseCatalog,
{
    /// Creates a batch router and runs crash recovery: jobs stuck in
    /// `executing` return to `failed`, and the uploaded-events cache is
    /// seeded from orphan journal entries.
    pub async fn new(
        queue: Q,
        catalog: C,
        storage: Storage,
        settings: BatchRouterSettings,
        config_rx: mpsc::Receiver<Sources>,
    ) -> EgressResult<Self> {
        let uploaded_events =
            crash_recover(&queue, &storage, settings.job_query_batch_size).await?;

        let (shutdown_tx, _) = create_shutdown_channel();

        let inner = RouterInner {
            queue,
            catalog,
            storage,
            settings,
            bindings: EnabledBindings::new(),
            in_progress: InProgressRegistry::new(),
            uploaded_events,
            enabled: Arc::new(AtomicBool::new(true)),
        };

        Ok(Self {
            inner: Arc::new(inner),
            config_rx,
            shutdown_tx,
        })
    }

    /// Returns a handle for sending shutdown signals to this router.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Spawns the config subscriber, the worker pool and the main loop.
    pub fn start(self) -> BatchRouterHandle {
        info!("starting batch router");

        let inner = self.inner;
        let shutdown_tx = self.shutdown_tx;

        let subscriber = spawn_config_subscriber(
            self.config_rx,
            inner.bindings.clone(),
            DestinationType::ALL.to_vec(),
            shutdown_tx.subscribe(),
        );

        let worker_count = inner.settings.workers.max(1);
        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(worker_count * 2);
        let batch_rx = Arc::new(Mutex::new(batch_rx));

        let mut tasks = Vec::with_capacity(worker_count + 1);
        for _ in 0..worker_count {
            tasks.push(tokio::spawn(worker_loop(
                inner.clone(),
                batch_rx.clone(),
                shutdown_tx.subscribe(),
            )));
        }
        tasks.push(tokio::spawn(main_loop(
            inner.clone(),
            batch_tx,
            shutdown_tx.subscribe(),
        )));

        BatchRouterHandle {
            shutdown_tx,
            enabled: inner.enabled.clone(),
            tasks,
            subscriber,
        }
    }
}

async fn main_loop<Q, C>(
    inner: Arc<RouterInner<Q, C>>,
    batch_tx: mpsc::Sender<Batch>,
    mut shutdown_rx: ShutdownRx,
) -> EgressResult<()>
where
    Q: JobQueue,
    C: WarehouseCatalog,
{
    loop {
        let enabled = inner.enabled.load(Ordering::Relaxed);
        let sleep = if enabled {
            inner.settings.main_loop_sleep()
        } else {
            inner.settings.main_loop_sleep() * 2
        };

        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("batch router main loop shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(sleep) => {}
        }

        if !inner.enabled.load(Ordering::Relaxed) {
            continue;
        }

        run_scheduling_pass(&inner, &batch_tx).await?;
    }
}

/// One pass over a stable snapshot of the enabled bindings.
async fn run_scheduling_pass<Q, C>(
    inner: &RouterInner<Q, C>,
    batch_tx: &mpsc::Sender<Batch>,
) -> EgressResult<()>
where
    Q: JobQueue,
    C: WarehouseCatalog,
{
    for binding in inner.bindings.snapshot() {
        let key = binding.in_progress_key();
        if !inner.in_progress.begin(&key) {
            continue;
        }

        let destination_types = [binding.destination_type()];
        let source_id = binding.source.id.clone();
        let mut budget = inner.settings.job_query_batch_size;

        let mut jobs = inner
            .queue
            .jobs_to_retry(&destination_types, budget, &source_id)
            .await?;
        budget = budget.saturating_sub(jobs.len());

        let waiting = inner
            .queue
            .waiting_jobs(&destination_types, budget, &source_id)
            .await?;
        budget = budget.saturating_sub(waiting.len());
        jobs.extend(waiting);

        let unprocessed = inner
            .queue
            .unprocessed_jobs(&destination_types, budget, &source_id)
            .await?;
        jobs.extend(unprocessed);

        if jobs.is_empty() {
            inner.in_progress.end(&key);
            continue;
        }

        debug!(
            "selected {} jobs for {} -> {}",
            jobs.len(),
            source_id,
            binding.destination.id
        );

        let statuses: Vec<JobStatus> = jobs.iter().map(JobStatus::executing).collect();
        inner
            .queue
            .update_job_statuses(statuses, &destination_types, Some(&source_id))
            .await?;

        if batch_tx.send(Batch { jobs, binding }).await.is_err() {
            // Workers are gone, shutdown is in flight.
            inner.in_progress.end(&key);
            return Ok(());
        }
    }

    Ok(())
}

async fn worker_loop<Q, C>(
    inner: Arc<RouterInner<Q, C>>,
    batch_rx: Arc<Mutex<mpsc::Receiver<Batch>>>,
    mut shutdown_rx: ShutdownRx,
) -> EgressResult<()>
where
    Q: JobQueue,
    C: WarehouseCatalog,
{
    loop {
        let batch = {
            let mut batch_rx = batch_rx.lock().await;
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                batch = batch_rx.recv() => batch,
            }
        };

        let Some(batch) = batch else {
            return Ok(());
        };

        let key = batch.binding.in_progress_key();
        let result = deliver_batch(&inner, &batch).await;
        inner.in_progress.end(&key);

        // Upload failures were already resolved into job statuses; anything
        // that reaches here is a broken invariant and takes the worker down.
        result?;
    }
}

/// Uploads one batch and resolves its jobs to a terminal status.
async fn deliver_batch<Q, C>(inner: &RouterInner<Q, C>, batch: &Batch) -> EgressResult<()>
where
    Q: JobQueue,
    C: WarehouseCatalog,
{
    let destination_type = batch.binding.destination_type();
    let is_warehouse = destination_type.is_warehouse();
    let provider = destination_type.object_storage_provider();

    let upload = copy_jobs_to_storage(inner, provider, batch, is_warehouse).await?;

    match &upload.outcome {
        Ok(stored) => {
            if is_warehouse {
                let schema = schema_from_jobs(&batch.jobs)?;
                inner
                    .catalog
                    .insert_staging_file(NewStagingFile {
                        location: stored.key.clone(),
                        source_id: batch.binding.source.id.clone(),
                        destination_id: batch.binding.destination.id.clone(),
                        schema: serde_json::to_value(schema)?,
                    })
                    .await?;
            }

            debug!(
                "uploaded batch of {} jobs to {}",
                batch.jobs.len(),
                stored.location
            );
            set_terminal_statuses(inner, batch, None).await?;
        }
        Err(err) => {
            warn!("error uploading batch to object storage: {err}");
            set_terminal_statuses(inner, batch, Some(err)).await?;
        }
    }

    inner.queue.journal_delete(upload.op_id).await?;

    if let Err(err) = tokio::fs::remove_file(&upload.local_path).await {
        debug!(
            "failed to remove local batch file {}: {err}",
            upload.local_path.display()
        );
    }

    Ok(())
}

/// Composes, compresses and uploads the batch content under a journal entry.
///
/// Only the upload itself is allowed to fail softly (captured in
/// [`BatchUpload::outcome`]); queue, filesystem and serialization failures
/// propagate.
async fn copy_jobs_to_storage<Q, C>(
    inner: &RouterInner<Q, C>,
    provider: StorageProvider,
    batch: &Batch,
    is_warehouse: bool,
) -> EgressResult<BatchUpload>
where
    Q: JobQueue,
    C: WarehouseCatalog,
{
    let settings = inner.storage.settings();
    let (bucket, folder, storage_config) = if is_warehouse {
        (
            settings.staging_bucket.clone(),
            settings.warehouse_folder.clone(),
            DestinationStorageConfig::default(),
        )
    } else {
        let config = batch.binding.destination.storage_config()?;
        (config.bucket_name.clone(), settings.raw_folder.clone(), config)
    };

    // Compose newline-delimited content, skipping events the crash-recovery
    // cache already saw in the object store.
    let mut content = Vec::new();
    for job in &batch.jobs {
        if let Some(message_id) = job.message_id()
            && inner.uploaded_events.contains(message_id)
        {
            continue;
        }
        serde_json::to_writer(&mut content, &job.payload)?;
        content.push(b'\n');
    }

    let compressed = gzip(&content)?;

    let source_id = batch.binding.source.id.as_str();
    let file_name = format!(
        "{}.{}.{}.json.gz",
        Utc::now().timestamp(),
        source_id,
        Uuid::new_v4()
    );
    let tmp_dir = std::env::temp_dir().join(if is_warehouse {
        "egress-warehouse-staging-uploads"
    } else {
        "egress-raw-dest-uploads"
    });
    tokio::fs::create_dir_all(&tmp_dir).await?;
    let local_path = tmp_dir.join(&file_name);
    tokio::fs::write(&local_path, &compressed).await?;

    let date = Utc::now().format("%m-%d-%Y").to_string();
    let key_parts = [folder.as_str(), source_id, date.as_str(), file_name.as_str()];

    let client = inner.storage.client(provider, &bucket, &storage_config)?;

    let op_payload = serde_json::to_value(StorageObject {
        provider,
        bucket: bucket.clone(),
        key: key_parts.join("/"),
    })?;
    let op_id = inner
        .queue
        .journal_mark_start(JournalOpType::RawUpload, op_payload)
        .await?;

    let outcome = client.upload(compressed, &key_parts).await;

    Ok(BatchUpload {
        op_id,
        local_path,
        outcome,
    })
}

async fn set_terminal_statuses<Q, C>(
    inner: &RouterInner<Q, C>,
    batch: &Batch,
    error: Option<&EgressError>,
) -> EgressResult<()>
where
    Q: JobQueue,
    C: WarehouseCatalog,
{
    let statuses: Vec<JobStatus> = match error {
        None => batch.jobs.iter().map(JobStatus::succeeded).collect(),
        Some(err) => {
            let message = err.to_string();
            batch
                .jobs
                .iter()
                .map(|job| JobStatus::failed(job, &message))
                .collect()
        }
    };

    inner
        .queue
        .update_job_statuses(
            statuses,
            &[batch.binding.destination_type()],
            Some(&batch.binding.source.id),
        )
        .await
}

/// Startup crash recovery.
///
/// Returns every `executing` job to `failed`, then seeds the uploaded-events
/// cache by scanning the objects referenced by open raw-upload journal
/// entries. A journal object that cannot be downloaded is skipped: its
/// upload never completed.
async fn crash_recover<Q: JobQueue>(
    queue: &Q,
    storage: &Storage,
    batch_size: usize,
) -> EgressResult<HashSet<String>> {
    loop {
        let executing = queue.executing_jobs(&[], batch_size).await?;
        if executing.is_empty() {
            break;
        }

        info!("batch router crash recovering {} jobs", executing.len());

        let statuses = executing
            .iter()
            .map(|job| JobStatus {
                job_id: job.id,
                attempt: job.attempt,
                state: JobState::Failed,
                error_response: serde_json::json!({}),
            })
            .collect();
        queue.update_job_statuses(statuses, &[], None).await?;
    }

    let mut uploaded_events = HashSet::new();

    for entry in queue.journal_entries(JournalOpType::RawUpload).await? {
        let object: StorageObject =
            serde_json::from_value(entry.payload.clone()).map_err(|err| {
                crate::egress_error!(
                    ErrorKind::InvalidData,
                    "Malformed journal payload",
                    err.to_string()
                )
            })?;

        let client = storage.client(
            object.provider,
            &object.bucket,
            &DestinationStorageConfig::default(),
        )?;

        match client.download(&object.key).await {
            Ok(bytes) => match gunzip(&bytes) {
                Ok(data) => {
                    for line in data.split(|byte| *byte == b'\n') {
                        if line.is_empty() {
                            continue;
                        }
                        let Ok(value) = serde_json::from_slice::<serde_json::Value>(line) else {
                            continue;
                        };
                        if let Some(message_id) = value.get("messageId").and_then(|id| id.as_str())
                        {
                            uploaded_events.insert(message_id.to_owned());
                        }
                    }
                }
                Err(err) => {
                    warn!("journal object {} is not valid gzip: {err}", object.key);
                }
            },
            Err(err) => {
                // The upload behind this entry never completed; its jobs were
                // already reset to failed above.
                debug!(
                    "skipping journal entry {} for {}: {err}",
                    entry.id, object.key
                );
            }
        }

        // The entry is consumed either way: the retry path re-journals its
        // own upload.
        queue.journal_delete(entry.id).await?;
    }

    if !uploaded_events.is_empty() {
        info!(
            "seeded uploaded-events cache with {} message ids from the journal",
            uploaded_events.len()
        );
    }

    Ok(uploaded_events)
}
