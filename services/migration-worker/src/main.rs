// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Migration worker
//!
//! `run` migrates one slice of the catalog and exits when the slice is
//! exhausted. `reconcile` reads every worker checkpoint and reports catalog
//! items none of them account for.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use migration_types::WorkerParams;
use migration_worker::catalog::{CatalogSource, SqliteCatalog};
use migration_worker::config::{self, WorkerConfig};
use migration_worker::destination::{Destination, HttpDestination};
use migration_worker::{Worker, WorkerOutcome, metrics, reconcile, worker};

#[derive(Parser)]
#[command(name = "migration-worker")]
#[command(about = "Migrate a media catalog to the destination service", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory shared with the fleet supervisor
    #[arg(long, default_value = config::DEFAULT_STATE_DIR, env = "MIGRATION_STATE_DIR")]
    state_dir: PathBuf,

    /// Source catalog database
    #[arg(long, default_value = "metadata.db", env = "MIGRATION_CATALOG")]
    catalog: PathBuf,

    /// Override for the catalog range query (?1 cursor, ?2 end, ?3 limit)
    #[arg(long, env = "MIGRATION_CATALOG_QUERY")]
    catalog_query: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate this worker's catalog slice
    Run(RunArgs),

    /// Report catalog items no checkpoint accounts for
    Reconcile {
        /// Number of missing items to list
        #[arg(long, default_value_t = reconcile::DEFAULT_SAMPLE_LIMIT)]
        limit: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Worker identity
    #[arg(long, env = "MIGRATION_WORKER_ID")]
    worker_id: u32,

    /// Root directory catalog paths are relative to
    #[arg(long, default_value = ".", env = "MIGRATION_LIBRARY_ROOT")]
    library_root: PathBuf,

    /// Destination service base URL
    #[arg(long, env = "MIGRATION_DESTINATION_URL")]
    destination_url: String,

    /// Bearer token for the destination service
    #[arg(long, env = "MIGRATION_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Start cursor (exclusive)
    #[arg(long, default_value_t = 0)]
    start: i64,

    /// End of this worker's slice (inclusive)
    #[arg(long)]
    end: Option<i64>,

    #[arg(long, default_value_t = config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    #[arg(long, default_value_t = config::DEFAULT_PARALLEL_UPLOADS)]
    parallel_uploads: usize,

    #[arg(long, default_value_t = config::DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Seconds without upload progress before an attempt is aborted
    #[arg(long, default_value_t = config::DEFAULT_STUCK_UPLOAD_SECS)]
    stuck_threshold_secs: u64,

    /// Stop after this many seconds even if work remains
    #[arg(long)]
    max_runtime_secs: Option<u64>,

    /// Upload nothing and keep the checkpoint in memory
    #[arg(long)]
    dry_run: bool,

    /// Ask the destination to reference files in place
    #[arg(long)]
    link_mode: bool,

    /// Converter for unsupported formats, with {input} and {output}
    #[arg(long, env = "MIGRATION_CONVERT_COMMAND")]
    convert_command: Option<String>,

    /// Consecutive all-duplicate batches before skipping ahead
    #[arg(long, default_value_t = config::DEFAULT_DUPLICATE_STREAK)]
    duplicate_streak: u32,

    /// Cursor stride for skip-ahead; 0 disables it
    #[arg(long, default_value_t = config::DEFAULT_SKIP_AHEAD_STRIDE)]
    skip_ahead_stride: i64,

    /// Prometheus textfile to write after every batch
    #[arg(long, env = "MIGRATION_METRICS_FILE")]
    metrics_file: Option<PathBuf>,
}

impl RunArgs {
    fn to_config(&self, cli: &Cli) -> WorkerConfig {
        WorkerConfig {
            worker_id: self.worker_id,
            state_dir: cli.state_dir.clone(),
            catalog_path: cli.catalog.clone(),
            catalog_query: cli.catalog_query.clone(),
            library_root: self.library_root.clone(),
            destination_url: self.destination_url.clone(),
            api_token: self.api_token.clone(),
            start_cursor: self.start,
            end_cursor: self.end,
            batch_size: self.batch_size,
            parallel_uploads: self.parallel_uploads,
            max_retries: self.max_retries,
            stuck_upload: Duration::from_secs(self.stuck_threshold_secs),
            max_runtime: self.max_runtime_secs.map(Duration::from_secs),
            dry_run: self.dry_run,
            link_mode: self.link_mode,
            convert_command: self.convert_command.clone(),
            duplicate_streak: self.duplicate_streak,
            skip_ahead_stride: self.skip_ahead_stride,
            metrics_file: self.metrics_file.clone(),
            ..Default::default()
        }
    }
}

/// Apply parameter overrides the supervisor left for this worker.
fn apply_params(config: &mut WorkerConfig, path: &Path) -> Result<()> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let params: WorkerParams =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    if let Some(n) = params.parallel_uploads {
        config.parallel_uploads = n;
    }
    if let Some(n) = params.batch_size {
        config.batch_size = n;
    }
    if let Some(secs) = params.stuck_threshold_secs {
        config.stuck_upload = Duration::from_secs(secs);
    }
    info!(path = %path.display(), ?params, "Applied supervisor parameter overrides");
    Ok(())
}

/// Pid file removed on drop.
struct PidFile(PathBuf);

impl PidFile {
    fn create(path: PathBuf) -> Result<Self> {
        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("writing pid file {}", path.display()))?;
        Ok(Self(path))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

async fn run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let mut config = args.to_config(cli);
    let params_path = config.files().params();
    apply_params(&mut config, &params_path)?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating {}", config.state_dir.display()))?;
    let _pid = PidFile::create(config.files().pid_file())?;

    metrics::register_metrics();

    let catalog: Arc<dyn CatalogSource> = Arc::new(
        SqliteCatalog::open(
            &config.catalog_path,
            config.catalog_query.clone(),
            config.db_busy_timeout,
        )
        .with_context(|| format!("opening catalog {}", config.catalog_path.display()))?,
    );
    let destination: Arc<dyn Destination> = Arc::new(
        HttpDestination::new(
            &config.destination_url,
            config.api_token.clone(),
            config.http_timeout,
        )
        .context("Failed to create destination client")?,
    );

    info!(
        worker_id = config.worker_id,
        catalog = %config.catalog_path.display(),
        destination = %config.destination_url,
        parallel_uploads = config.parallel_uploads,
        batch_size = config.batch_size,
        "Starting migration worker"
    );

    let worker = Worker::new(config, catalog, destination)
        .await
        .context("Failed to start worker")?;
    let outcome = worker.run(worker::shutdown_signal()).await?;

    match outcome {
        WorkerOutcome::Completed { cursor, uploaded } => {
            info!(cursor, uploaded, "Slice complete");
        }
        WorkerOutcome::Interrupted { cursor, uploaded } => {
            info!(cursor, uploaded, "Stopped before the end of the slice");
        }
    }
    Ok(())
}

async fn run_reconcile(cli: &Cli, limit: usize, json: bool) -> Result<()> {
    let checkpoints = reconcile::load_checkpoints(&cli.state_dir)
        .with_context(|| format!("reading checkpoints in {}", cli.state_dir.display()))?;
    let catalog: Arc<dyn CatalogSource> = Arc::new(
        SqliteCatalog::open(
            &cli.catalog,
            cli.catalog_query.clone(),
            Duration::from_millis(config::DEFAULT_DB_BUSY_TIMEOUT_MS),
        )
        .with_context(|| format!("opening catalog {}", cli.catalog.display()))?,
    );

    let report =
        reconcile::reconcile(catalog, &checkpoints, config::DEFAULT_BATCH_SIZE, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Reconciliation");
    println!("{}", "=".repeat(50));
    println!("  Workers:   {:?}", report.workers);
    println!("  Catalog:   {}", report.total);
    println!("  Accounted: {}", report.accounted);
    println!("  Missing:   {}", report.missing_count);
    println!("  Skipped:   {}", report.skipped.len());

    if !report.missing.is_empty() {
        println!();
        println!("{:<12} PATH", "ID");
        println!("{}", "-".repeat(64));
        for item in &report.missing {
            println!("{:<12} {}", item.id, item.path);
        }
    }
    if !report.skipped.is_empty() {
        println!();
        println!("{:<8} {:<40} REASON", "WORKER", "PATH");
        println!("{}", "-".repeat(64));
        for item in &report.skipped {
            println!(
                "{:<8} {:<40} {}",
                item.worker_id,
                item.path,
                item.reason.as_deref().unwrap_or("-")
            );
        }
    }

    if !report.is_complete() {
        std::process::exit(2);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Both providers may be compiled in; pick one explicitly.
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "migration_worker=info".to_string()),
        ))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Run(args) => run(&cli, args).await,
        Commands::Reconcile { limit, json } => run_reconcile(&cli, *limit, *json).await,
    }
}
