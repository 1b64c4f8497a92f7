use chrono::Local;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::archive::OutputPipeline;
use super::databases::{DatabaseFilter, Retriever};
use super::db_dump::Dumper;
use super::naming::FilenameTemplate;
use super::pool::{Drain, PoolFailure, SizablePool};
use crate::errors::{CycleError, JobError};
use crate::storage::Storage;

/// The unit of work for one database within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    pub database: String,
    pub key: String,
    pub compress: bool,
}

/// Knobs of a cycle that come straight from configuration.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub filter: DatabaseFilter,
    pub pool_size: i64,
    pub template: FilenameTemplate,
    pub compress: bool,
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub cycle_id: Uuid,
    /// Databases left after filtering, in dispatch order.
    pub selected: Vec<String>,
    pub succeeded: usize,
}

/// One complete pass over the selected databases: enumerate, filter, then
/// dump each database into storage through the worker pool.
pub struct BackupCycle {
    retriever: Arc<dyn Retriever>,
    dumper: Arc<dyn Dumper>,
    storage: Arc<dyn Storage>,
    filter: DatabaseFilter,
    pool: SizablePool,
    template: FilenameTemplate,
    compress: bool,
    draining: Mutex<Option<Drain>>,
}

impl BackupCycle {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        dumper: Arc<dyn Dumper>,
        storage: Arc<dyn Storage>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            retriever,
            dumper,
            storage,
            filter: settings.filter,
            pool: SizablePool::new(settings.pool_size),
            template: settings.template,
            compress: settings.compress,
            draining: Mutex::new(None),
        }
    }

    pub fn dumper(&self) -> Arc<dyn Dumper> {
        Arc::clone(&self.dumper)
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// Runs a single cycle. Work left over from a previous failed cycle is
    /// joined first so two cycles never dump concurrently.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<CycleOutcome, CycleError> {
        self.quiesce().await;

        let cycle_id = Uuid::new_v4();
        let span = info_span!("backup_cycle", %cycle_id);
        self.run_cycle(cancel.child_token(), cycle_id)
            .instrument(span)
            .await
    }

    /// Waits for jobs a failed cycle left running in the background.
    pub async fn quiesce(&self) {
        let pending = self.draining.lock().await.take();
        if let Some(drain) = pending {
            let in_flight = drain.in_flight();
            if in_flight > 0 {
                info!(in_flight, "Waiting for jobs from the previous attempt to stop");
            }
            drain.wait().await;
        }
    }

    /// Derives one job per database, all sharing a single timestamp.
    pub fn plan(&self, databases: &[String]) -> Vec<BackupJob> {
        let now = Local::now();
        databases
            .iter()
            .map(|database| BackupJob {
                database: database.clone(),
                key: self.template.filename(database, self.compress, &now),
                compress: self.compress,
            })
            .collect()
    }

    async fn run_cycle(
        &self,
        cancel: CancellationToken,
        cycle_id: Uuid,
    ) -> Result<CycleOutcome, CycleError> {
        let found = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CycleError::Cancelled),
            found = self.retriever.retrieve() => found.map_err(CycleError::Enumeration)?,
        };
        debug!(databases = ?found, "Enumerated databases");

        let selected = self.filter.apply(found)?;
        if selected.is_empty() {
            warn!("No databases selected for backup, nothing to do");
            return Ok(CycleOutcome {
                cycle_id,
                selected,
                succeeded: 0,
            });
        }

        let jobs = self.plan(&selected);
        info!(
            databases = selected.len(),
            workers = self.pool.size(),
            format = self.template.pattern(),
            "Starting database backups"
        );

        let dumper = Arc::clone(&self.dumper);
        let storage = Arc::clone(&self.storage);
        let handler = move |token: CancellationToken, job: BackupJob| {
            let dumper = Arc::clone(&dumper);
            let storage = Arc::clone(&storage);
            async move { run_job(dumper.as_ref(), storage.as_ref(), &token, job).await }
        };

        match self.pool.start(&cancel, jobs, handler).await {
            Ok(report) => {
                info!(databases = report.handled, "Backup cycle completed");
                Ok(CycleOutcome {
                    cycle_id,
                    selected,
                    succeeded: report.handled,
                })
            }
            Err(PoolFailure { error, draining }) => {
                let in_flight = draining.in_flight();
                if in_flight > 0 {
                    warn!(
                        in_flight,
                        "Cycle failed while jobs were still running; they were asked to stop"
                    );
                }
                *self.draining.lock().await = Some(draining);
                Err(error.into())
            }
        }
    }
}

/// Opens the destination, dumps into it, then closes the pipeline. A failed
/// dump aborts the pipeline instead, so no truncated object is published; the
/// dump error wins over any abort failure.
async fn run_job(
    dumper: &dyn Dumper,
    storage: &dyn Storage,
    cancel: &CancellationToken,
    job: BackupJob,
) -> Result<(), JobError> {
    let started = Instant::now();
    let destination = storage
        .open_writer(&job.key)
        .await
        .map_err(|source| JobError::Open {
            database: job.database.clone(),
            source,
        })?;

    let mut pipeline = OutputPipeline::new(destination, job.compress);
    if let Err(source) = dumper.dump(cancel, &job.database, pipeline.writer()).await {
        if let Err(e) = pipeline.abort().await {
            warn!(db = %job.database, error = %e, "Failed to discard output after dump failure");
        }
        error!(db = %job.database, error = %source, "Database dump failed");
        return Err(JobError::Dump {
            database: job.database,
            source,
        });
    }

    pipeline.close().await.map_err(|source| JobError::Close {
        database: job.database.clone(),
        source,
    })?;
    info!(
        db = %job.database,
        filename = %job.key,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Backed up database"
    );
    Ok(())
}
