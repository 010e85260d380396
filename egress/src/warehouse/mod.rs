//! The warehouse uploader: staged batches in, merged destination tables out.
//!
//! Per warehouse destination type, a main loop resumes the pending upload of
//! each binding or opens a new one over the next contiguous range of staging
//! files. A worker pool turns staging files into per-table load files
//! (fanned out to a builder pool), then hands the upload to the dialect
//! driver for schema migration and export.

pub mod base;
pub mod bigquery;
pub mod driver;
pub mod load_file;
pub mod memory;
pub mod redshift;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use egress_config::shared::WarehouseSettings;
use egress_postgres::types::{
    NewLoadFile, NewUpload, StagingFileRow, StagingFileStatus, UploadRow, UploadStatus,
};

use crate::catalog::WarehouseCatalog;
use crate::compression::{gunzip, gzip};
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::{EgressError, EgressResult, ErrorKind};
use crate::router::progress::InProgressRegistry;
use crate::router::subscriber::{EnabledBindings, spawn_config_subscriber};
use crate::storage::Storage;
use crate::types::{
    Binding, Destination, DestinationType, Sources, WarehouseSchema, consolidate_schemas,
    namespace_from_source_name, schema_from_value,
};
use crate::warehouse::base::WarehouseFactory;
use crate::warehouse::driver::ProcessStage;
use crate::warehouse::load_file::build_load_files;

/// One upload's worth of staging files to process.
struct ProcessStagingFilesJob {
    upload: UploadRow,
    files: Vec<StagingFileRow>,
    binding: Binding,
}

/// One staging file to turn into per-table load files.
struct LoadFileJob {
    upload_id: i64,
    destination: Destination,
    destination_type: DestinationType,
    schema: Arc<WarehouseSchema>,
    staging_file: StagingFileRow,
    done: oneshot::Sender<EgressResult<()>>,
}

struct WarehouseInner<C, F> {
    destination_type: DestinationType,
    catalog: C,
    factory: F,
    storage: Storage,
    settings: WarehouseSettings,
    bindings: EnabledBindings,
    in_progress: InProgressRegistry,
    enabled: Arc<AtomicBool>,
}

/// The warehouse uploader for one destination type. Create with
/// [`WarehouseRouter::new`], start the loops with [`WarehouseRouter::start`].
pub struct WarehouseRouter<C, F> {
    inner: Arc<WarehouseInner<C, F>>,
    config_rx: mpsc::Receiver<Sources>,
    shutdown_tx: ShutdownTx,
}

/// Handle to a running warehouse router.
pub struct WarehouseRouterHandle {
    shutdown_tx: ShutdownTx,
    enabled: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<EgressResult<()>>>,
    subscriber: JoinHandle<()>,
}

impl WarehouseRouterHandle {
    /// Signals every task of the router to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.shutdown();
    }

    /// Pauses scheduling; in-flight uploads still complete.
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
                    "Warehouse task panicked",
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

impl<C, F> WarehouseRouter<C, F>
where
    C: WarehouseCatalog,
    F: WarehouseFactory,
{
    pub fn new(
        destination_type: DestinationType,
        catalog: C,
        factory: F,
        storage: Storage,
        settings: WarehouseSettings,
        config_rx: mpsc::Receiver<Sources>,
    ) -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();

        let inner = WarehouseInner {
            destination_type,
            catalog,
            factory,
            storage,
            settings,
            bindings: EnabledBindings::new(),
            in_progress: InProgressRegistry::new(),
            enabled: Arc::new(AtomicBool::new(true)),
        };

        Self {
            inner: Arc::new(inner),
            config_rx,
            shutdown_tx,
        }
    }

    /// Returns a handle for sending shutdown signals to this router.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Spawns the config subscriber, both worker pools and the main loop.
    pub fn start(self) -> WarehouseRouterHandle {
        info!(
            "starting warehouse router for {}",
            self.inner.destination_type
        );

        let inner = self.inner;
        let shutdown_tx = self.shutdown_tx;

        let subscriber = spawn_config_subscriber(
            self.config_rx,
            inner.bindings.clone(),
            vec![inner.destination_type],
            shutdown_tx.subscribe(),
        );

        let worker_count = inner.settings.workers.max(1);
        let (process_tx, process_rx) = mpsc::channel::<ProcessStagingFilesJob>(worker_count * 2);
        let process_rx = Arc::new(Mutex::new(process_rx));
        let (load_tx, load_rx) = mpsc::channel::<LoadFileJob>(worker_count * 2);
        let load_rx = Arc::new(Mutex::new(load_rx));

        let mut tasks = Vec::with_capacity(worker_count * 2 + 1);
        for _ in 0..worker_count {
            tasks.push(tokio::spawn(process_worker_loop(
                inner.clone(),
                process_rx.clone(),
                load_tx.clone(),
                shutdown_tx.subscribe(),
            )));
            tasks.push(tokio::spawn(load_file_worker_loop(
                inner.clone(),
                load_rx.clone(),
                shutdown_tx.subscribe(),
            )));
        }
        drop(load_tx);
        tasks.push(tokio::spawn(main_loop(
            inner.clone(),
            process_tx,
            shutdown_tx.subscribe(),
        )));

        WarehouseRouterHandle {
            shutdown_tx,
            enabled: inner.enabled.clone(),
            tasks,
            subscriber,
        }
    }
}

async fn main_loop<C, F>(
    inner: Arc<WarehouseInner<C, F>>,
    process_tx: mpsc::Sender<ProcessStagingFilesJob>,
    mut shutdown_rx: ShutdownRx,
) -> EgressResult<()>
where
    C: WarehouseCatalog,
    F: WarehouseFactory,
{
    loop {
        if !inner.enabled.load(Ordering::Relaxed) {
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                _ = tokio::time::sleep(inner.settings.main_loop_sleep()) => {}
            }
            continue;
        }

        run_upload_pass(&inner, &process_tx).await?;

        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("warehouse main loop shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(inner.settings.upload_sleep()) => {}
        }
    }
}

/// One pass over a stable snapshot of the warehouse bindings.
async fn run_upload_pass<C, F>(
    inner: &Arc<WarehouseInner<C, F>>,
    process_tx: &mpsc::Sender<ProcessStagingFilesJob>,
) -> EgressResult<()>
where
    C: WarehouseCatalog,
    F: WarehouseFactory,
{
    for binding in inner.bindings.snapshot() {
        // Warehouse work is keyed by destination: one upload per destination
        // at a time.
        let key = binding.destination.id.clone();
        if !inner.in_progress.begin(&key) {
            continue;
        }

        let source_id = binding.source.id.clone();
        let destination_id = binding.destination.id.clone();

        if let Some(pending) = inner.catalog.pending_upload(&source_id, &destination_id).await? {
            if pending.error_attempts() >= inner.settings.max_upload_attempts {
                warn!(
                    "aborting upload {} after {} failed attempts",
                    pending.id,
                    pending.error_attempts()
                );
                inner
                    .catalog
                    .set_upload_status(pending.id, UploadStatus::Aborted)
                    .await?;
                inner.in_progress.end(&key);
                continue;
            }

            if pending.status.needs_load_files() {
                // Load-file generation was interrupted; re-drive it over the
                // upload's staging-file range instead of opening a second
                // upload.
                let files = inner
                    .catalog
                    .staging_files_in_range(
                        &source_id,
                        &destination_id,
                        pending.start_staging_file_id,
                        pending.end_staging_file_id,
                    )
                    .await?;
                if files.is_empty() {
                    return Err(crate::egress_error!(
                        ErrorKind::InvalidState,
                        "Pending upload references missing staging files",
                        pending.id
                    ));
                }

                debug!("re-generating load files for upload {}", pending.id);
                if process_tx
                    .send(ProcessStagingFilesJob {
                        upload: pending,
                        files,
                        binding,
                    })
                    .await
                    .is_err()
                {
                    inner.in_progress.end(&key);
                    return Ok(());
                }
                continue;
            }

            // Load files exist: resume the warehouse flow, skipping schema
            // migration when it already completed.
            let stage = if pending.status.ready_for_export() {
                ProcessStage::ExportData
            } else {
                ProcessStage::UpdateSchema
            };

            debug!("resuming upload {} at {:?}", pending.id, stage);

            let catalog = inner.catalog.clone();
            let factory = inner.factory.clone();
            let in_progress = inner.in_progress.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    run_warehouse_flow(&catalog, &factory, &binding, &pending, stage).await
                {
                    error!("failed to resume upload {}: {err}", pending.id);
                }
                in_progress.end(&key);
            });
            continue;
        }

        // No pending upload: open one over the next contiguous page of
        // staging files.
        let after = inner
            .catalog
            .last_exported_staging_file_id(&source_id, &destination_id)
            .await?;
        let files = inner
            .catalog
            .staging_files_after(
                &source_id,
                &destination_id,
                after,
                inner.settings.staging_files_batch_size,
            )
            .await?;
        if files.is_empty() {
            inner.in_progress.end(&key);
            continue;
        }

        let mut schemas = Vec::with_capacity(files.len());
        for file in &files {
            schemas.push(schema_from_value(&file.schema)?);
        }
        let consolidated = consolidate_schemas(schemas.iter());

        let namespace = namespace_from_source_name(&binding.source.name);
        let start_load_file_id = inner
            .catalog
            .last_exported_load_file_id(&source_id, &destination_id)
            .await?;

        let upload = inner
            .catalog
            .create_upload(NewUpload {
                source_id: source_id.clone(),
                namespace,
                destination_id: destination_id.clone(),
                destination_type: inner.destination_type.as_str().to_owned(),
                start_staging_file_id: files.first().map(|file| file.id).unwrap_or(0),
                end_staging_file_id: files.last().map(|file| file.id).unwrap_or(0),
                start_load_file_id,
                schema: serde_json::to_value(&consolidated)?,
            })
            .await?;

        info!(
            "created upload {} over staging files {}..={} for {}",
            upload.id, upload.start_staging_file_id, upload.end_staging_file_id, destination_id
        );

        if process_tx
            .send(ProcessStagingFilesJob {
                upload,
                files,
                binding,
            })
            .await
            .is_err()
        {
            inner.in_progress.end(&key);
            return Ok(());
        }
    }

    Ok(())
}

/// Connects to the destination and runs the upload driver; connection
/// failures land on the upload row like any other schema-stage failure.
async fn run_warehouse_flow<C, F>(
    catalog: &C,
    factory: &F,
    binding: &Binding,
    upload: &UploadRow,
    stage: ProcessStage,
) -> EgressResult<()>
where
    C: WarehouseCatalog,
    F: WarehouseFactory,
{
    let warehouse = match factory.connect(binding, &upload.namespace).await {
        Ok(warehouse) => warehouse,
        Err(err) => {
            warn!("failed to connect to warehouse for upload {}: {err}", upload.id);
            catalog
                .set_upload_error(upload.id, UploadStatus::UpdatingSchemaFailed, &err.to_string())
                .await?;
            return Ok(());
        }
    };

    driver::process_upload(catalog, &warehouse, upload, stage).await
}

async fn process_worker_loop<C, F>(
    inner: Arc<WarehouseInner<C, F>>,
    process_rx: Arc<Mutex<mpsc::Receiver<ProcessStagingFilesJob>>>,
    load_tx: mpsc::Sender<LoadFileJob>,
    mut shutdown_rx: ShutdownRx,
) -> EgressResult<()>
where
    C: WarehouseCatalog,
    F: WarehouseFactory,
{
    loop {
        let job = {
            let mut process_rx = process_rx.lock().await;
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                job = process_rx.recv() => job,
            }
        };

        let Some(job) = job else {
            return Ok(());
        };

        let key = job.binding.destination.id.clone();
        let result = process_staging_files(&inner, &load_tx, job).await;
        inner.in_progress.end(&key);

        result?;
    }
}

/// Fans a staging-file batch out to the load-file builders, then drives the
/// upload through the warehouse flow.
async fn process_staging_files<C, F>(
    inner: &Arc<WarehouseInner<C, F>>,
    load_tx: &mpsc::Sender<LoadFileJob>,
    job: ProcessStagingFilesJob,
) -> EgressResult<()>
where
    C: WarehouseCatalog,
    F: WarehouseFactory,
{
    let ids: Vec<i64> = job.files.iter().map(|file| file.id).collect();
    inner
        .catalog
        .set_staging_files_status(&ids, StagingFileStatus::Executing)
        .await?;

    let schema = Arc::new(schema_from_value(&job.upload.schema)?);

    let mut receivers = Vec::with_capacity(job.files.len());
    for file in &job.files {
        let (done_tx, done_rx) = oneshot::channel();
        let load_job = LoadFileJob {
            upload_id: job.upload.id,
            destination: job.binding.destination.clone(),
            destination_type: inner.destination_type,
            schema: schema.clone(),
            staging_file: file.clone(),
            done: done_tx,
        };
        if load_tx.send(load_job).await.is_err() {
            return Err(crate::egress_error!(
                ErrorKind::InvalidState,
                "Load-file workers are gone"
            ));
        }
        receivers.push(done_rx);
    }

    let mut first_error: Option<EgressError> = None;
    for done_rx in receivers {
        match done_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(_) => {
                if first_error.is_none() {
                    first_error = Some(crate::egress_error!(
                        ErrorKind::InvalidState,
                        "Load-file worker dropped its result"
                    ));
                }
            }
        }
    }

    if let Some(err) = first_error {
        warn!(
            "failed to generate load files for upload {}: {err}",
            job.upload.id
        );
        inner
            .catalog
            .set_staging_files_status(&ids, StagingFileStatus::Failed)
            .await?;
        inner
            .catalog
            .set_upload_error(
                job.upload.id,
                UploadStatus::GeneratingLoadFileFailed,
                &err.to_string(),
            )
            .await?;

        if err.kind().is_fatal() {
            return Err(err);
        }
        return Ok(());
    }

    inner
        .catalog
        .set_staging_files_status(&ids, StagingFileStatus::Succeeded)
        .await?;

    let end_load_file_id = inner
        .catalog
        .last_load_file_id(&job.upload.source_id, &job.upload.destination_id)
        .await?;
    inner
        .catalog
        .set_upload_generated(job.upload.id, end_load_file_id)
        .await?;

    let mut upload = job.upload;
    upload.end_load_file_id = end_load_file_id;
    upload.status = UploadStatus::GeneratedLoadFile;

    run_warehouse_flow(
        &inner.catalog,
        &inner.factory,
        &job.binding,
        &upload,
        ProcessStage::Full,
    )
    .await
}

async fn load_file_worker_loop<C, F>(
    inner: Arc<WarehouseInner<C, F>>,
    load_rx: Arc<Mutex<mpsc::Receiver<LoadFileJob>>>,
    mut shutdown_rx: ShutdownRx,
) -> EgressResult<()>
where
    C: WarehouseCatalog,
    F: WarehouseFactory,
{
    loop {
        let job = {
            let mut load_rx = load_rx.lock().await;
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                job = load_rx.recv() => job,
            }
        };

        let Some(job) = job else {
            return Ok(());
        };

        let result = build_and_upload_load_files(&inner, &job).await;
        let _ = job.done.send(result);
    }
}

/// Downloads one staging file and emits one load file per destination table.
async fn build_and_upload_load_files<C, F>(
    inner: &Arc<WarehouseInner<C, F>>,
    job: &LoadFileJob,
) -> EgressResult<()>
where
    C: WarehouseCatalog,
    F: WarehouseFactory,
{
    let provider = job.destination_type.object_storage_provider();

    let staging_client = inner.storage.staging_client(provider)?;
    let compressed = staging_client.download(&job.staging_file.location).await?;
    let data = gunzip(&compressed)?;

    let files = build_load_files(&data, &job.schema, job.destination_type, Utc::now())?;

    let destination_config = job.destination.storage_config()?;
    let destination_client =
        inner
            .storage
            .client(provider, &destination_config.bucket_name, &destination_config)?;

    let base_name = job
        .staging_file
        .location
        .rsplit('/')
        .next()
        .unwrap_or(job.staging_file.location.as_str())
        .trim_end_matches(".json.gz");
    let extension = if job.destination_type == DestinationType::BigQuery {
        "json.gz"
    } else {
        "csv.gz"
    };
    let upload_id = job.upload_id.to_string();
    let load_objects_folder = inner.storage.settings().load_objects_folder.clone();

    for (table, content) in files {
        let compressed = gzip(&content)?;
        let file_name = format!("{base_name}.{table}.{extension}");
        let stored = destination_client
            .upload(
                compressed,
                &[
                    load_objects_folder.as_str(),
                    table.as_str(),
                    job.staging_file.source_id.as_str(),
                    upload_id.as_str(),
                    file_name.as_str(),
                ],
            )
            .await?;

        inner
            .catalog
            .insert_load_file(NewLoadFile {
                staging_file_id: job.staging_file.id,
                source_id: job.staging_file.source_id.clone(),
                destination_id: job.staging_file.destination_id.clone(),
                destination_type: job.destination_type.as_str().to_owned(),
                table_name: table,
                location: stored.location,
            })
            .await?;
    }

    Ok(())
}
