//! Multi-config driver.
//!
//! A batch run owns the shared context, the download queue, the change cache
//! and the checkpoint for its whole duration. Configs are planned, the
//! version metadata of every source file involved is prefetched once, and
//! then each config is exported. A failing config is recorded and the run
//! moves on; only failing to persist run state ends the run early.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheHandle, DEFAULT_CACHE_FILE};
use crate::checkpoint::{default_ttl, BatchCheckpoint, CheckpointStore};
use crate::context::{with_context, ContextSeed, ExportContext};
use crate::contract::{ConfigExporter, Fetcher, FileDownloader};
use crate::error::{BatchError, ExportError, StateError};
use crate::export::{export_config, ConfigReport, ExportOptions, ExportPlan};
use crate::processor::process_entries;
use crate::queue::{DownloadQueue, QueueOptions};

/// The collaborators a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub downloader: Arc<dyn FileDownloader>,
    pub exporter: Arc<dyn ConfigExporter>,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Units per config, and files per download job, handled at once.
    pub concurrency: usize,
    /// Configs exported at once.
    pub parallel: usize,
    /// Resume a matching checkpoint instead of starting over.
    pub resume: bool,
    /// Export every unit regardless of the change cache.
    pub force: bool,
    pub cache_path: PathBuf,
    /// Directory holding the checkpoint file.
    pub state_dir: PathBuf,
    pub checkpoint_ttl: chrono::Duration,
    pub max_concurrent_jobs: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            parallel: 1,
            resume: true,
            force: false,
            cache_path: PathBuf::from(DEFAULT_CACHE_FILE),
            state_dir: PathBuf::from("."),
            checkpoint_ttl: default_ttl(),
            max_concurrent_jobs: QueueOptions::default().max_concurrent_jobs,
        }
    }
}

impl BatchOptions {
    fn export_options(&self) -> ExportOptions {
        ExportOptions {
            concurrency: self.concurrency,
            force: self.force,
        }
    }

    fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            max_concurrent_jobs: self.max_concurrent_jobs,
            files_per_job: self.concurrency,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailedConfig {
    pub config: PathBuf,
    pub error: ExportError,
}

/// Outcome of a batch run.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: Uuid,
    /// Whether an earlier, interrupted run was picked up.
    pub resumed: bool,
    pub completed: Vec<ConfigReport>,
    pub failed: Vec<FailedConfig>,
    /// Configs already completed by the resumed run and not run again.
    pub resumed_skipped: Vec<PathBuf>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn processed(&self) -> usize {
        self.completed.iter().map(|r| r.processed).sum()
    }

    pub fn skipped(&self) -> usize {
        self.completed.iter().map(|r| r.skipped).sum()
    }

    /// Human readable summary, one line per config.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for report in &self.completed {
            let _ = writeln!(
                out,
                "ok      {}: {} processed, {} skipped, {} downloaded",
                report.config, report.processed, report.skipped, report.downloaded_files
            );
        }
        for path in &self.resumed_skipped {
            let _ = writeln!(out, "resumed {}: completed by an earlier run", path.display());
        }
        for failed in &self.failed {
            let _ = writeln!(out, "failed  {}: {}", failed.config.display(), failed.error);
        }
        let _ = write!(
            out,
            "{} completed, {} failed, {} skipped from checkpoint ({} units processed, {} unchanged)",
            self.completed.len(),
            self.failed.len(),
            self.resumed_skipped.len(),
            self.processed(),
            self.skipped()
        );
        if !self.failed.is_empty() {
            let _ = write!(out, "\nrerun to retry:");
            for failed in &self.failed {
                let _ = write!(out, " {}", failed.config.display());
            }
        }
        out
    }
}

fn config_id(path: &Path) -> String {
    path.display().to_string()
}

fn dedup(configs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = BTreeSet::new();
    configs
        .iter()
        .filter(|p| seen.insert(p.as_path()))
        .cloned()
        .collect()
}

async fn record(
    checkpoint: &Mutex<BatchCheckpoint>,
    store: &CheckpointStore,
    path: &Path,
    succeeded: bool,
) -> Result<(), StateError> {
    let mut checkpoint = checkpoint.lock().await;
    if succeeded {
        checkpoint.mark_completed(path);
    } else {
        checkpoint.mark_failed(path);
    }
    store.save(&checkpoint)
}

/// Exports every config in `configs`, resuming an interrupted run if one
/// matches.
pub async fn run_batch(
    configs: &[PathBuf],
    collaborators: &Collaborators,
    options: &BatchOptions,
) -> Result<BatchReport, BatchError> {
    let configs = dedup(configs);
    let store = CheckpointStore::new(&options.state_dir);
    if !options.resume {
        info!(path = %store.path().display(), "[BATCH] Resume disabled, discarding checkpoint");
        store.remove()?;
    }
    let (checkpoint, resumed) =
        store.resume_or_create(&configs, Utc::now(), options.checkpoint_ttl)?;
    let batch_id = checkpoint.batch_id;
    let pending = checkpoint.pending_paths(&configs);
    let resumed_skipped: Vec<PathBuf> = configs
        .iter()
        .filter(|p| checkpoint.is_completed(p))
        .cloned()
        .collect();
    info!(
        %batch_id,
        configs = configs.len(),
        pending = pending.len(),
        resumed,
        "[BATCH] Starting batch"
    );
    let checkpoint = Mutex::new(checkpoint);

    let cache = CacheHandle::load(&options.cache_path);
    let ctx = ExportContext::new(
        Arc::clone(&collaborators.fetcher),
        ContextSeed {
            cache: Some(cache.clone()),
            ..ContextSeed::default()
        },
    );
    let queue = DownloadQueue::new(Arc::clone(&collaborators.downloader), options.queue_options());
    let exporter = collaborators.exporter.as_ref();
    let parallel = options.parallel.max(1);

    let mut failed = Vec::new();
    let mut planned: Vec<(PathBuf, ExportPlan)> = Vec::new();
    let plans = match process_entries(pending, parallel, |path: PathBuf| {
        let ctx = &ctx;
        async move {
            let plan = exporter.plan(&path, ctx).await;
            Ok::<_, Infallible>((path, plan))
        }
    })
    .await
    {
        Ok(plans) => plans,
        Err(failure) => match failure.into_source() {},
    };
    for (path, plan) in plans {
        match plan {
            Ok(plan) => planned.push((path, plan)),
            Err(error) => {
                error!(config = %path.display(), %error, "[BATCH] Could not plan config");
                record(&checkpoint, &store, &path, false).await?;
                failed.push(FailedConfig { config: path, error });
            }
        }
    }

    let file_ids: Vec<String> = planned
        .iter()
        .map(|(_, plan)| plan.file_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    ctx.prefetch_versions(file_ids, options.concurrency).await;

    let export_options = options.export_options();
    let (ctx, queue, checkpoint, store) = (&ctx, &queue, &checkpoint, &store);
    let outcomes = process_entries(planned, parallel, |(path, plan)| {
        let export_options = &export_options;
        async move {
            let outcome = export_config(ctx, queue, exporter, &plan, export_options).await;
            record(checkpoint, store, &path, outcome.is_ok()).await?;
            Ok::<_, StateError>((path, outcome))
        }
    })
    .await
    .map_err(|failure| {
        error!(config = failure.index, cancelled = failure.cancelled.len(), error = %failure.source, "[BATCH] Could not persist checkpoint, stopping");
        BatchError::State(failure.into_source())
    })?;

    let mut completed = Vec::new();
    for (path, outcome) in outcomes {
        match outcome {
            Ok(report) => completed.push(report),
            Err(error) => {
                error!(config = %path.display(), %error, "[BATCH] Config failed");
                failed.push(FailedConfig { config: path, error });
            }
        }
    }

    cache.persist()?;
    if failed.is_empty() {
        store.remove()?;
        info!(%batch_id, completed = completed.len(), "[BATCH] Batch finished");
    } else {
        warn!(
            %batch_id,
            completed = completed.len(),
            failed = failed.len(),
            "[BATCH] Batch finished with failures, checkpoint kept for resume"
        );
    }

    Ok(BatchReport {
        batch_id,
        resumed,
        completed,
        failed,
        resumed_skipped,
    })
}

/// Exports a single config outside of any batch.
///
/// Uses a transient context and no checkpoint. When `cache` is given it is
/// consulted and updated in memory; persisting it is up to the caller.
pub async fn export_single(
    config: &Path,
    collaborators: &Collaborators,
    cache: Option<CacheHandle>,
    options: &ExportOptions,
) -> Result<ConfigReport, ExportError> {
    let queue = DownloadQueue::new(
        Arc::clone(&collaborators.downloader),
        QueueOptions {
            files_per_job: options.concurrency,
            ..QueueOptions::default()
        },
    );
    let exporter = collaborators.exporter.as_ref();
    with_context(None, Arc::clone(&collaborators.fetcher), |ctx| async move {
        if let Some(cache) = cache {
            ctx.attach_cache(cache);
        }
        let plan = exporter.plan(config, &ctx).await?;
        info!(config = %config_id(config), units = plan.units.len(), "[EXPORT] Planned config");
        export_config(&ctx, &queue, exporter, &plan, options).await
    })
    .await
}
