// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Fleet supervisor
//!
//! `run` drives the control loop. `status` prints the last published fleet
//! status and recent fixes. `reset-worker` clears a paused worker's fix
//! budget on the next cycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use fleet_supervisor::config::{self, SupervisorConfig};
use fleet_supervisor::diskio::{DiskIoSource, NoDiskIo, ProcDiskStats};
use fleet_supervisor::history::FixHistory;
use fleet_supervisor::process::{LauncherSettings, ProcessLauncher};
use fleet_supervisor::{FleetStatus, Supervisor, metrics, supervisor};
use migration_types::WorkerFiles;

#[derive(Parser)]
#[command(name = "fleet-supervisor")]
#[command(about = "Supervise and scale a fleet of migration workers", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory shared with the workers
    #[arg(long, default_value = config::DEFAULT_STATE_DIR, env = "MIGRATION_STATE_DIR")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop
    Run(RunArgs),

    /// Show the fleet status written by the last cycle
    Status {
        /// Fix records to show
        #[arg(long, default_value_t = 10)]
        fixes: usize,

        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Clear a worker's pause and fix budget
    ResetWorker {
        /// Worker id
        id: u32,
    },
}

#[derive(Args)]
struct RunArgs {
    /// JSON file with tuning knobs; re-read on SIGUSR1
    #[arg(long, env = "FLEET_SUPERVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Worker executable
    #[arg(long, default_value = "migration-worker", env = "FLEET_WORKER_BINARY")]
    worker_binary: PathBuf,

    /// Device holding the catalog, as named in /proc/diskstats
    #[arg(long, env = "FLEET_DISK_DEVICE")]
    disk_device: Option<String>,

    /// Directory source patches are confined to
    #[arg(long, env = "FLEET_PATCH_ROOT")]
    patch_root: Option<PathBuf>,

    /// Prometheus textfile written after every cycle
    #[arg(long, env = "FLEET_METRICS_FILE")]
    metrics_file: Option<PathBuf>,

    /// Catalog ids per worker slice (overrides the config file)
    #[arg(long)]
    slice_size: Option<i64>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Arguments passed to every worker before `run`
    #[arg(last = true)]
    worker_args: Vec<String>,
}

impl RunArgs {
    async fn to_config(&self, cli: &Cli) -> Result<SupervisorConfig> {
        let mut config = match &self.config {
            Some(path) => SupervisorConfig::from_file(path).await?,
            None => SupervisorConfig::default(),
        };
        config.state_dir = cli.state_dir.clone();
        config.worker_binary = self.worker_binary.clone();
        config.worker_args = self.worker_args.clone();
        config.patch_root = self.patch_root.clone();
        config.disk_device = self.disk_device.clone();
        config.metrics_file = self.metrics_file.clone();
        if let Some(n) = self.slice_size {
            config.slice_size = n;
        }
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }
}

async fn run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let config = args.to_config(cli).await?;
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating {}", config.state_dir.display()))?;

    metrics::register_metrics();

    let launcher = Arc::new(ProcessLauncher::new(LauncherSettings {
        binary: config.worker_binary.clone(),
        args: config.worker_args.clone(),
        state_dir: config.state_dir.clone(),
        slice_size: config.slice_size,
        grace: Duration::from_secs(config.kill_grace_secs),
    }));
    let disk: Arc<dyn DiskIoSource> = match &config.disk_device {
        Some(device) => Arc::new(ProcDiskStats::new(device.clone())),
        None => Arc::new(NoDiskIo),
    };

    let (config_tx, config_rx) = watch::channel(config.clone());
    if let Some(path) = &args.config {
        tokio::spawn(SupervisorConfig::start_config_watcher(
            path.clone(),
            config.clone(),
            config_tx,
        ));
    } else {
        // Nothing to reload; the loop stops listening once this is gone.
        drop(config_tx);
    }

    info!(
        state_dir = %config.state_dir.display(),
        worker_binary = %config.worker_binary.display(),
        min_workers = config.min_workers,
        max_workers = config.max_workers,
        disk_device = config.disk_device.as_deref().unwrap_or("-"),
        "Starting fleet supervisor"
    );

    let mut supervisor =
        Supervisor::new(config, launcher, disk).context("Failed to open fix history")?;
    supervisor
        .run(supervisor::shutdown_signal(), config_rx, args.once)
        .await;
    Ok(())
}

fn show_status(cli: &Cli, fixes: usize, json: bool) -> Result<()> {
    let status = FleetStatus::load(&cli.state_dir)?;
    let history = FixHistory::open(&cli.state_dir, usize::MAX)?;
    let skip = history.records().len().saturating_sub(fixes);
    let recent = &history.records()[skip..];

    if json {
        let out = serde_json::json!({ "status": status, "recent_fixes": recent });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Fleet Status");
    println!("{}", "=".repeat(50));
    println!("  Updated:  {}", status.updated_at.to_rfc3339());
    println!("  Desired:  {}", status.desired_workers);
    println!("  Running:  {:?}", status.running_workers);
    match status.disk_utilization {
        Some(pct) => println!("  Disk:     {:.1}%", pct),
        None => println!("  Disk:     unknown"),
    }
    println!();

    if status.workers.is_empty() {
        println!("No workers found.");
    } else {
        println!(
            "{:<8} {:<22} {:>7} {:>8} {:<12} {:>12} {:>10}",
            "WORKER", "STATE", "SCORE", "TREND", "REMEDIATION", "CURSOR", "IDLE"
        );
        println!("{}", "-".repeat(86));
        for w in &status.workers {
            let remediation = serde_json::to_value(w.remediation)?;
            println!(
                "{:<8} {:<22} {:>7.1} {:>8} {:<12} {:>12} {:>10}",
                w.worker_id,
                format!("{}{}", w.state.as_str(), if w.running { "" } else { " (down)" }),
                w.score,
                w.trend.map_or("-".to_string(), |t| format!("{:+.1}", t)),
                remediation.as_str().unwrap_or("-"),
                w.cursor,
                w.idle_secs.map_or("-".to_string(), |s| format!("{}s", s)),
            );
        }
    }

    if !recent.is_empty() {
        println!();
        println!(
            "{:<26} {:<8} {:<14} {:<9} {:<9} ROOT CAUSE",
            "TIME", "WORKER", "FIX", "APPLIED", "VERIFIED"
        );
        println!("{}", "-".repeat(86));
        for r in recent {
            println!(
                "{:<26} {:<8} {:<14} {:<9} {:<9} {}",
                r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                r.worker_id,
                r.fix_type.to_string(),
                r.success,
                r.verified_success
                    .map_or("pending".to_string(), |v| v.to_string()),
                r.root_cause
            );
        }
    }
    Ok(())
}

fn reset_worker(cli: &Cli, id: u32) -> Result<()> {
    let marker = WorkerFiles::new(&cli.state_dir, id).reset_marker();
    std::fs::write(&marker, "")
        .with_context(|| format!("writing {}", marker.display()))?;
    println!("Worker {} will be reset on the next supervisor cycle.", id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "fleet_supervisor=info".to_string()),
        ))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Run(args) => run(&cli, args).await,
        Commands::Status { fixes, json } => show_status(&cli, *fixes, *json),
        Commands::ResetWorker { id } => reset_worker(&cli, *id),
    }
}
