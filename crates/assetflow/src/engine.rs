//! The engine: owns the database handle, both worker pools and the step
//! handlers, and exposes the operations an outer layer calls.

use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::broadcast::{ProgressBroadcaster, ProgressEvent};
use crate::config::Config;
use crate::db::process_repo::{self, NewProcess, ProcessRow};
use crate::db::project_repo::{self, AssetRow, NewAsset, ProjectRow};
use crate::db::Database;
use crate::error::{AssetflowError, Result, WorkerError};
use crate::extraction::{
    CredentialProvider, DatabaseCredentials, ExtractionWorker, RetryPolicy, TextExtractor,
};
use crate::process::{
    ExtractionStep, HandlerRegistry, ProcessProgress, ProcessRunner, StepHandler,
    EXTRACT_PROCESS_TYPE,
};
use crate::recovery::{self, RecoveryReport, RecoverySink};
use crate::worker::WorkerPool;

/// Pool sizing and retry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub extraction_workers: usize,
    pub process_workers: usize,
    pub queue_capacity: Option<usize>,
    pub retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            extraction_workers: 5,
            process_workers: 5,
            queue_capacity: None,
            retry: RetryPolicy::NONE,
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            extraction_workers: config.workers.extraction,
            process_workers: config.workers.process,
            queue_capacity: config.workers.queue_capacity,
            retry: RetryPolicy::new(
                config.extraction.max_retries,
                config.extraction.retry_backoff_ms,
            ),
        }
    }
}

/// A process with its completed step count, as listed for a project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    #[serde(flatten)]
    pub process: ProcessRow,
    pub completed_step_count: u64,
}

pub struct EngineBuilder {
    db: Database,
    extractor: Arc<dyn TextExtractor>,
    options: EngineOptions,
    credentials: Option<Arc<dyn CredentialProvider>>,
    handlers: Vec<(String, Arc<dyn StepHandler>)>,
    progress: ProgressBroadcaster,
}

impl EngineBuilder {
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the default database-backed credential provider.
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Registers a handler for an additional process type.
    pub fn handler(mut self, process_type: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.push((process_type.into(), handler));
        self
    }

    pub fn progress(mut self, progress: ProgressBroadcaster) -> Self {
        self.progress = progress;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(DatabaseCredentials::new(self.db.clone())));

        let extraction = Arc::new(ExtractionWorker::new(
            self.db.clone(),
            credentials,
            self.extractor,
            self.options.retry,
            self.progress.clone(),
        ));

        let mut registry = HandlerRegistry::new();
        registry.register(
            EXTRACT_PROCESS_TYPE,
            Arc::new(ExtractionStep::new(self.db.clone(), Arc::clone(&extraction))),
        );
        for (process_type, handler) in self.handlers {
            registry.register(process_type, handler);
        }

        let mut process_types: Vec<&str> = registry.process_types().collect();
        process_types.sort_unstable();
        info!("Step handlers registered for: {}", process_types.join(", "));

        let runner = Arc::new(ProcessRunner::new(
            self.db.clone(),
            registry,
            self.progress.clone(),
        ));

        let extraction_pool = WorkerPool::new(
            "extraction",
            extraction,
            self.options.extraction_workers,
            self.options.queue_capacity,
        )?;
        let process_pool = WorkerPool::new(
            "process",
            Arc::clone(&runner),
            self.options.process_workers,
            self.options.queue_capacity,
        )?;

        info!(
            "Engine started with {} extraction and {} process workers",
            self.options.extraction_workers, self.options.process_workers
        );

        Ok(Engine {
            db: self.db,
            extraction_pool,
            process_pool,
            runner,
            progress: self.progress,
        })
    }
}

pub struct Engine {
    db: Database,
    extraction_pool: WorkerPool<i64>,
    process_pool: WorkerPool<i64>,
    runner: Arc<ProcessRunner>,
    progress: ProgressBroadcaster,
}

impl Engine {
    pub fn builder(db: Database, extractor: Arc<dyn TextExtractor>) -> EngineBuilder {
        EngineBuilder {
            db,
            extractor,
            options: EngineOptions::default(),
            credentials: None,
            handlers: Vec::new(),
            progress: ProgressBroadcaster::default(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Queues extraction of one asset and returns immediately.
    ///
    /// A rejected submission is logged; the asset keeps no content and is
    /// picked up again by the next startup recovery.
    pub fn submit_extraction(&self, asset_id: i64) {
        if let Err(e) = self.extraction_pool.submit(asset_id) {
            warn!("Could not queue extraction of asset {}: {}", asset_id, e);
        }
    }

    /// Queues advancement of a process and returns immediately. Terminal
    /// processes are left untouched when the job runs.
    pub fn submit_process(&self, process_id: i64) {
        if let Err(e) = self.process_pool.submit(process_id) {
            warn!("Could not queue process {}: {}", process_id, e);
        }
    }

    pub fn process_progress(&self, process_id: i64) -> Result<ProcessProgress> {
        process_repo::get_progress(&self.db, process_id)?.ok_or(AssetflowError::NotFound {
            entity: "process",
            id: process_id,
        })
    }

    pub fn list_processes(&self, project_id: i64) -> Result<Vec<ProcessSummary>> {
        self.require_project(project_id)?;
        Ok(process_repo::list_processes(&self.db, project_id)?
            .into_iter()
            .map(|(process, completed_step_count)| ProcessSummary {
                process,
                completed_step_count,
            })
            .collect())
    }

    pub fn run_startup_recovery(&self) -> RecoveryReport {
        recovery::run_startup_recovery(&self.db, self)
    }

    pub fn create_project(&self, name: &str, description: &str) -> Result<ProjectRow> {
        Ok(project_repo::create_project(&self.db, name, description)?)
    }

    /// Stores an asset whose bytes are already at `asset.path`, then queues
    /// its extraction once the insert is committed.
    pub fn register_asset(&self, project_id: i64, asset: &NewAsset) -> Result<AssetRow> {
        self.require_project(project_id)?;
        let row = project_repo::create_asset(&self.db, project_id, asset)?;
        self.submit_extraction(row.id);
        Ok(row)
    }

    /// A page of a project's assets, newest first, with the total count.
    pub fn list_assets(
        &self,
        project_id: i64,
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<AssetRow>, u64)> {
        self.require_project(project_id)?;
        Ok(project_repo::list_assets(&self.db, project_id, limit, offset)?)
    }

    /// Soft-deletes an asset. Steps that still reference it fail when run.
    pub fn delete_asset(&self, asset_id: i64) -> Result<()> {
        if project_repo::soft_delete_asset(&self.db, asset_id)? {
            info!("Deleted asset {}", asset_id);
            Ok(())
        } else {
            Err(AssetflowError::NotFound {
                entity: "asset",
                id: asset_id,
            })
        }
    }

    /// Creates a process with one pending step per asset and queues it.
    pub fn create_process(&self, project_id: i64, process: &NewProcess) -> Result<ProcessRow> {
        self.require_project(project_id)?;
        for &asset_id in &process.asset_ids {
            match project_repo::get_asset(&self.db, asset_id)? {
                Some(asset) if asset.project_id == project_id => {}
                _ => {
                    return Err(AssetflowError::NotFound {
                        entity: "asset",
                        id: asset_id,
                    })
                }
            }
        }

        let row = process_repo::create_process(&self.db, project_id, process)?;
        info!(
            "Created process {} ({}) with {} step(s)",
            row.id,
            row.process_type,
            process.asset_ids.len()
        );
        self.submit_process(row.id);
        Ok(row)
    }

    /// Marks a process STOPPED. A step already running finishes; no further
    /// step starts. Returns false if the process was already terminal.
    pub fn stop_process(&self, process_id: i64) -> Result<bool> {
        self.require_process(process_id)?;
        let stopped = process_repo::stop_process(&self.db, process_id)?;
        if stopped {
            info!("Stopped process {}", process_id);
            self.progress.send(ProgressEvent::process_finished(
                process_id,
                crate::process::ProcessStatus::Stopped,
            ));
        }
        Ok(stopped)
    }

    /// Requeues FAILED steps and resubmits the process.
    pub fn retry_failed_steps(&self, process_id: i64) -> Result<usize> {
        self.require_process(process_id)?;
        let requeued = process_repo::retry_failed_steps(&self.db, process_id)?;
        if requeued > 0 {
            info!("Requeued {} failed step(s) of process {}", requeued, process_id);
            self.submit_process(process_id);
        }
        Ok(requeued)
    }

    /// Soft-deletes a project with its assets, processes and steps.
    pub fn delete_project(&self, project_id: i64) -> Result<()> {
        if project_repo::soft_delete_project(&self.db, project_id)? {
            info!("Deleted project {}", project_id);
            Ok(())
        } else {
            Err(AssetflowError::NotFound {
                entity: "project",
                id: project_id,
            })
        }
    }

    /// Soft-deletes a process with its steps. A run in flight stops before
    /// its next step.
    pub fn delete_process(&self, process_id: i64) -> Result<()> {
        if process_repo::soft_delete_process(&self.db, process_id)? {
            info!("Deleted process {}", process_id);
            Ok(())
        } else {
            Err(AssetflowError::NotFound {
                entity: "process",
                id: process_id,
            })
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Whether a process is being advanced by a worker right now.
    pub fn is_process_running(&self, process_id: i64) -> bool {
        self.runner.is_running(process_id)
    }

    /// Stops accepting work, lets queued jobs finish and joins all workers.
    pub fn shutdown(self) {
        info!("Shutting down engine...");
        self.extraction_pool.shutdown();
        self.process_pool.shutdown();
        self.process_pool.wait();
        self.extraction_pool.wait();
        info!("Engine stopped");
    }

    fn require_project(&self, project_id: i64) -> Result<ProjectRow> {
        project_repo::get_project(&self.db, project_id)?.ok_or(AssetflowError::NotFound {
            entity: "project",
            id: project_id,
        })
    }

    fn require_process(&self, process_id: i64) -> Result<ProcessRow> {
        process_repo::get_process(&self.db, process_id)?.ok_or(AssetflowError::NotFound {
            entity: "process",
            id: process_id,
        })
    }
}

impl RecoverySink for Engine {
    fn submit_extraction(&self, asset_id: i64) -> std::result::Result<(), WorkerError> {
        self.extraction_pool.submit(asset_id)
    }

    fn submit_process(&self, process_id: i64) -> std::result::Result<(), WorkerError> {
        self.process_pool.submit(process_id)
    }
}
