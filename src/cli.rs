use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use designsync_core::batch::{export_single, run_batch, BatchOptions, Collaborators};
use designsync_core::cache::{CacheHandle, DEFAULT_CACHE_FILE};
use designsync_core::export::ExportOptions;

use crate::exporter::JsonExporter;
use crate::http::HttpClient;

/// CLI for designsync: incremental, resumable design asset exports.
#[derive(Parser)]
#[clap(
    name = "designsync",
    version,
    about = "Export design-tool components and variables to JSON, skipping unchanged work"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export a single config
    Export {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Change cache file
        #[clap(long, default_value = DEFAULT_CACHE_FILE)]
        cache: PathBuf,
        /// Re-export every unit, ignoring the change cache
        #[clap(long)]
        force: bool,
        /// Units exported at the same time
        #[clap(long, default_value_t = 8)]
        concurrency: usize,
    },
    /// Export many configs as one resumable batch
    Batch {
        /// Paths to the YAML config files
        #[clap(required = true)]
        configs: Vec<PathBuf>,
        /// Configs exported at the same time
        #[clap(long, default_value_t = 1)]
        parallel: usize,
        /// Units per config exported at the same time
        #[clap(long, default_value_t = 8)]
        concurrency: usize,
        /// Start over instead of resuming an interrupted batch
        #[clap(long)]
        no_resume: bool,
        /// Re-export every unit, ignoring the change cache
        #[clap(long)]
        force: bool,
        /// Change cache file
        #[clap(long, default_value = DEFAULT_CACHE_FILE)]
        cache: PathBuf,
        /// Directory for the batch checkpoint
        #[clap(long, default_value = ".")]
        state_dir: PathBuf,
    },
}

fn collaborators() -> Result<Collaborators> {
    let client = Arc::new(HttpClient::new_from_env()?);
    Ok(Collaborators {
        fetcher: client.clone(),
        downloader: client,
        exporter: Arc::new(JsonExporter::new()),
    })
}

async fn export(config: PathBuf, cache: PathBuf, force: bool, concurrency: usize) -> Result<()> {
    let collaborators = collaborators()?;
    let cache = CacheHandle::load(cache);
    let options = ExportOptions { concurrency, force };
    println!("Export starting...");
    match export_single(&config, &collaborators, Some(cache.clone()), &options).await {
        Ok(report) => {
            cache.persist()?;
            println!(
                "Export complete: {} processed, {} skipped, {} downloaded",
                report.processed, report.skipped, report.downloaded_files
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("[ERROR] Export of {} failed: {}", config.display(), e);
            Err(anyhow::Error::msg(e))
        }
    }
}

async fn batch(configs: Vec<PathBuf>, options: BatchOptions) -> Result<()> {
    let collaborators = collaborators()?;
    println!("Batch starting...");
    let report = run_batch(&configs, &collaborators, &options).await?;
    println!("Batch complete.\nReport:");
    println!("{}", report.summary());
    if report.is_success() {
        Ok(())
    } else {
        eprintln!("[ERROR] {} config(s) failed", report.failed.len());
        Err(anyhow::anyhow!("{} of {} configs failed", report.failed.len(), configs.len()))
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    let result = match cli.command {
        Commands::Export {
            config,
            cache,
            force,
            concurrency,
        } => export(config, cache, force, concurrency).await,
        Commands::Batch {
            configs,
            parallel,
            concurrency,
            no_resume,
            force,
            cache,
            state_dir,
        } => {
            let options = BatchOptions {
                concurrency,
                parallel,
                resume: !no_resume,
                force,
                cache_path: cache,
                state_dir,
                ..BatchOptions::default()
            };
            batch(configs, options).await
        }
    };

    let exit_span = tracing::info_span!("exit");
    exit_span.in_scope(|| {
        tracing::info!(success = result.is_ok(), "exit");
    });

    result
}
