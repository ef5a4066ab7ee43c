//! Per-config export pipeline.
//!
//! For one config:
//!   1. look up the source file's version through the context and let the
//!      change cache drop fingerprints from older versions
//!   2. fingerprint every unit and skip those the cache says are unchanged
//!   3. hand the remote inputs of the remaining units to the shared download
//!      queue as a single job (local-only inputs bypass it)
//!   4. emit the remaining units through the bounded fan-out, fail-fast
//!   5. merge the new fingerprints into the shared cache in one step
//!
//! Nothing is recorded in the cache unless the whole config succeeded.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::cache::ChangeCache;
use crate::context::ExportContext;
use crate::contract::{ConfigExporter, FileRef};
use crate::error::ExportError;
use crate::hasher::{hash, Fingerprint};
use crate::processor::process_entries;
use crate::queue::DownloadQueue;

/// One independently exportable item of a config.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportUnit {
    /// Stable id within the source file (e.g. a node id).
    pub id: String,
    pub name: String,
    /// Serialized content the fingerprint is computed over.
    pub content: Vec<u8>,
    /// Inputs the unit needs, resolved before it is emitted.
    pub files: Vec<FileRef>,
}

impl ExportUnit {
    pub fn fingerprint(&self) -> Fingerprint {
        hash(&self.content)
    }
}

/// Everything the pipeline needs to know about one config.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportPlan {
    /// Identifies the config (usually its path) in logs, jobs and reports.
    pub config_id: String,
    /// Source file the units come from.
    pub file_id: String,
    /// Download priority of the config's job; lower goes first.
    pub priority: i32,
    /// Where the exporter writes its output.
    pub output_dir: PathBuf,
    pub units: Vec<ExportUnit>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    /// Units emitted at the same time.
    pub concurrency: usize,
    /// Export every unit regardless of the cache.
    pub force: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            force: false,
        }
    }
}

/// What happened to one config.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigReport {
    pub config: String,
    pub file_id: String,
    /// Units that were emitted.
    pub processed: usize,
    /// Units skipped because their fingerprint was unchanged.
    pub skipped: usize,
    pub downloaded_files: usize,
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

struct Pending<'a> {
    unit: &'a ExportUnit,
    fingerprint: Fingerprint,
}

/// Runs one planned config through cache, queue and exporter.
pub async fn export_config(
    ctx: &ExportContext,
    queue: &DownloadQueue,
    exporter: &dyn ConfigExporter,
    plan: &ExportPlan,
    options: &ExportOptions,
) -> Result<ConfigReport, ExportError> {
    let started = Instant::now();
    info!(config = %plan.config_id, file_id = %plan.file_id, units = plan.units.len(), "[EXPORT] Starting config");

    let cache = ctx.cache();
    let version = ctx.file_version(&plan.file_id).await?;
    if let Some(cache) = cache {
        if cache.observe_version(&plan.file_id, &version.version) {
            info!(file_id = %plan.file_id, version = %version.version, "[EXPORT] Source file changed version, re-exporting all units");
        }
    }

    let mut pending = Vec::new();
    let mut skipped = 0;
    for unit in &plan.units {
        let fingerprint = unit.fingerprint();
        let unchanged = !options.force
            && cache.is_some_and(|c| c.is_unchanged(&plan.file_id, &unit.id, fingerprint));
        if unchanged {
            debug!(config = %plan.config_id, unit = %unit.id, "[EXPORT] Unchanged, skipping");
            skipped += 1;
        } else {
            debug!(config = %plan.config_id, unit = %unit.id, %fingerprint, "[EXPORT] Changed or new");
            pending.push(Pending { unit, fingerprint });
        }
    }

    // One job for the whole config; slice the resolved paths back per unit.
    let inputs: Vec<FileRef> = pending
        .iter()
        .flat_map(|p| p.unit.files.iter().cloned())
        .collect();
    let downloaded_files = inputs.iter().filter(|f| f.is_remote()).count();
    let mut resolved = queue
        .resolve(&plan.config_id, plan.priority, inputs)
        .await?
        .into_iter();
    let work: Vec<(Pending<'_>, Vec<PathBuf>)> = pending
        .into_iter()
        .map(|p| {
            let files = resolved.by_ref().take(p.unit.files.len()).collect();
            (p, files)
        })
        .collect();

    let emitted = process_entries(work, options.concurrency, |(p, files)| async move {
        exporter.emit(plan, p.unit, &files).await?;
        Ok::<_, ExportError>((p.unit.id.as_str(), p.fingerprint))
    })
    .await
    .map_err(|failure| {
        error!(
            config = %plan.config_id,
            unit = failure.index,
            cancelled = failure.cancelled.len(),
            error = %failure.source,
            "[EXPORT] Unit failed, config aborted"
        );
        failure.into_source()
    })?;

    let processed = emitted.len();
    if let Some(cache) = cache {
        let mut partial = ChangeCache::new();
        for (unit_id, fingerprint) in emitted {
            partial.record(&plan.file_id, unit_id, fingerprint);
        }
        cache.merge(partial);
    }

    let report = ConfigReport {
        config: plan.config_id.clone(),
        file_id: plan.file_id.clone(),
        processed,
        skipped,
        downloaded_files,
        elapsed: started.elapsed(),
    };
    info!(
        config = %report.config,
        processed = report.processed,
        skipped = report.skipped,
        downloaded = report.downloaded_files,
        "[EXPORT] Config finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheHandle, ChangeCache};
    use crate::context::ContextSeed;
    use crate::contract::{
        FileVersion, MockConfigExporter, MockFetcher, MockFileDownloader, RemoteFile,
    };
    use crate::queue::QueueOptions;
    use std::sync::{Arc, Mutex};

    fn unit(id: &str, content: &str, files: Vec<FileRef>) -> ExportUnit {
        ExportUnit {
            id: id.into(),
            name: format!("unit {id}"),
            content: content.as_bytes().to_vec(),
            files,
        }
    }

    fn plan(units: Vec<ExportUnit>) -> ExportPlan {
        ExportPlan {
            config_id: "icons.yaml".into(),
            file_id: "f1".into(),
            priority: 0,
            output_dir: PathBuf::from("out"),
            units,
        }
    }

    fn context(version: &str, cache: ChangeCache) -> (ExportContext, CacheHandle) {
        let handle = CacheHandle::in_memory(cache);
        let ctx = ExportContext::new(
            Arc::new(MockFetcher::new()),
            ContextSeed {
                versions: vec![FileVersion {
                    file_id: "f1".into(),
                    version: version.into(),
                    last_modified: None,
                    name: None,
                }],
                cache: Some(handle.clone()),
                ..ContextSeed::default()
            },
        );
        (ctx, handle)
    }

    fn idle_queue() -> DownloadQueue {
        let mut downloader = MockFileDownloader::new();
        downloader.expect_download_file().never();
        DownloadQueue::new(Arc::new(downloader), QueueOptions::default())
    }

    #[tokio::test]
    async fn unchanged_units_are_skipped_and_changed_ones_emitted() {
        let units = vec![unit("1:1", "red", vec![]), unit("1:2", "blue", vec![])];
        let mut cache = ChangeCache::new();
        cache.observe_version("f1", "v1");
        cache.record("f1", "1:1", hash(b"red"));
        cache.record("f1", "1:2", hash(b"green"));
        let (ctx, handle) = context("v1", cache);

        let emitted = Arc::new(Mutex::new(Vec::new()));
        let seen = emitted.clone();
        let mut exporter = MockConfigExporter::new();
        exporter.expect_emit().returning(move |_, unit, _| {
            seen.lock().unwrap().push(unit.id.clone());
            Ok(())
        });

        let report = export_config(&ctx, &idle_queue(), &exporter, &plan(units), &ExportOptions::default())
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(*emitted.lock().unwrap(), vec!["1:2".to_string()]);
        assert!(handle.is_unchanged("f1", "1:2", hash(b"blue")));
    }

    #[tokio::test]
    async fn version_change_forces_re_export() {
        let mut cache = ChangeCache::new();
        cache.observe_version("f1", "v1");
        cache.record("f1", "1:1", hash(b"red"));
        let (ctx, handle) = context("v2", cache);

        let mut exporter = MockConfigExporter::new();
        exporter.expect_emit().times(1).returning(|_, _, _| Ok(()));

        let report = export_config(
            &ctx,
            &idle_queue(),
            &exporter,
            &plan(vec![unit("1:1", "red", vec![])]),
            &ExportOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(handle.snapshot().version("f1"), Some("v2"));
    }

    #[tokio::test]
    async fn force_ignores_fingerprints() {
        let mut cache = ChangeCache::new();
        cache.observe_version("f1", "v1");
        cache.record("f1", "1:1", hash(b"red"));
        let (ctx, _handle) = context("v1", cache);

        let mut exporter = MockConfigExporter::new();
        exporter.expect_emit().times(1).returning(|_, _, _| Ok(()));
        let options = ExportOptions {
            force: true,
            ..ExportOptions::default()
        };
        let report = export_config(&ctx, &idle_queue(), &exporter, &plan(vec![unit("1:1", "red", vec![])]), &options)
            .await
            .unwrap();
        assert_eq!((report.processed, report.skipped), (1, 0));
    }

    #[tokio::test]
    async fn remote_inputs_are_downloaded_and_sliced_per_unit() {
        let (ctx, _handle) = context("v1", ChangeCache::new());
        let mut downloader = MockFileDownloader::new();
        downloader
            .expect_download_file()
            .times(2)
            .returning(|f| Ok(PathBuf::from("/dl").join(&f.name)));
        let queue = DownloadQueue::new(Arc::new(downloader), QueueOptions::default());

        let remote = |name: &str| {
            FileRef::Remote(RemoteFile {
                url: format!("https://cdn.example/{name}"),
                name: name.into(),
            })
        };
        let units = vec![
            unit("a", "A", vec![remote("a.svg"), FileRef::Local(PathBuf::from("a.json"))]),
            unit("b", "B", vec![]),
            unit("c", "C", vec![remote("c.svg")]),
        ];

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let mut exporter = MockConfigExporter::new();
        exporter.expect_emit().returning(move |_, unit, files| {
            sink.lock().unwrap().push((unit.id.clone(), files.to_vec()));
            Ok(())
        });

        let report = export_config(&ctx, &queue, &exporter, &plan(units), &ExportOptions::default())
            .await
            .unwrap();
        assert_eq!(report.downloaded_files, 2);

        let mut received = received.lock().unwrap().clone();
        received.sort();
        assert_eq!(
            received,
            vec![
                ("a".to_string(), vec![PathBuf::from("/dl/a.svg"), PathBuf::from("a.json")]),
                ("b".to_string(), vec![]),
                ("c".to_string(), vec![PathBuf::from("/dl/c.svg")]),
            ]
        );
    }

    #[tokio::test]
    async fn failing_unit_fails_config_and_records_nothing() {
        let (ctx, handle) = context("v1", ChangeCache::new());
        let mut exporter = MockConfigExporter::new();
        exporter.expect_emit().returning(|_, unit, _| {
            if unit.id == "bad" {
                Err(ExportError::Emit {
                    unit: unit.id.clone(),
                    reason: "disk full".into(),
                })
            } else {
                Ok(())
            }
        });

        let units = vec![unit("ok", "1", vec![]), unit("bad", "2", vec![])];
        let err = export_config(&ctx, &idle_queue(), &exporter, &plan(units), &ExportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Emit { ref unit, .. } if unit == "bad"));
        assert!(handle.snapshot().is_empty());
    }

    #[tokio::test]
    async fn without_cache_everything_is_processed() {
        let ctx = ExportContext::new(
            Arc::new(MockFetcher::new()),
            ContextSeed {
                versions: vec![FileVersion {
                    file_id: "f1".into(),
                    version: "v1".into(),
                    last_modified: None,
                    name: None,
                }],
                ..ContextSeed::default()
            },
        );
        let mut exporter = MockConfigExporter::new();
        exporter.expect_emit().times(2).returning(|_, _, _| Ok(()));
        let units = vec![unit("x", "1", vec![]), unit("y", "2", vec![])];
        let report = export_config(&ctx, &idle_queue(), &exporter, &plan(units), &ExportOptions::default())
            .await
            .unwrap();
        assert_eq!(report.processed, 2);
    }
}
