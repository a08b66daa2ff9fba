// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Supervisor configuration
//!
//! Paths and process settings come from the command line and are fixed for
//! the life of the process. The tuning knobs can also be given in a JSON
//! file; that file is re-read on SIGUSR1 and the reloadable subset is
//! pushed to the control loop through a watch channel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Default directory shared with the workers
pub const DEFAULT_STATE_DIR: &str = "/var/tmp/migration";

/// What to do once a worker has used up its fix budget
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    /// Stop remediating and raise an alert
    #[default]
    PauseAndAlert,
    /// Terminate the worker, then pause and alert
    HardStop,
    /// Try one fix of a different kind before pausing
    DeferToAlternateFix,
}

/// Supervisor configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Note: not reloadable
    #[serde(skip)]
    pub state_dir: PathBuf,

    /// Worker executable. Note: not reloadable
    #[serde(skip)]
    pub worker_binary: PathBuf,

    /// Arguments passed to every worker before `run`. Note: not reloadable
    #[serde(skip)]
    pub worker_args: Vec<String>,

    /// Root that source patches are confined to. Note: not reloadable
    #[serde(skip)]
    pub patch_root: Option<PathBuf>,

    /// Block device holding the catalog, as named in /proc/diskstats.
    /// Note: not reloadable
    #[serde(skip)]
    pub disk_device: Option<String>,

    /// Prometheus textfile written after every cycle. Note: not reloadable
    #[serde(skip)]
    pub metrics_file: Option<PathBuf>,

    /// Seconds between control cycles
    pub cycle_interval_secs: u64,

    /// Bytes of each activity log read per cycle
    pub activity_tail_bytes: u64,

    /// Stuck threshold once a worker has uploaded something
    pub upload_stuck_secs: u64,

    /// Stuck threshold while a worker is still discovering
    pub discovery_stuck_secs: u64,

    /// Window in which progress signals count towards the progress score
    pub progress_window_secs: u64,

    /// Error rate above which the stuck threshold is shortened
    pub error_rate_threshold: f64,

    /// Minimum time between two fixes for one worker
    pub fix_cooldown_secs: u64,

    /// Fixes allowed per worker in `fix_window_secs`
    pub max_fix_attempts: usize,

    /// Rolling window for the fix budget
    pub fix_window_secs: u64,

    /// Wait after a fix before checking whether it worked
    pub verify_window_secs: u64,

    /// Upper bound on cycles skipped by per-worker backoff
    pub max_backoff_cycles: u32,

    pub escalation: Escalation,

    /// Prior occurrences of a root cause that turn a restart into a patch
    pub recurring_cause_threshold: u32,

    /// Keyword similarity at which two root causes are the same
    pub recurring_cause_similarity: f64,

    /// Entries kept in the fix history
    pub fix_history_max: usize,

    /// External advisor; receives JSON context on stdin
    pub advisor_command: Option<String>,

    pub advisor_timeout_secs: u64,

    /// Syntax check for patched files other than JSON and TOML; `{file}`
    /// is replaced by the patched path
    pub patch_validator: Option<String>,

    pub min_workers: usize,
    pub max_workers: usize,

    /// Workers started when the supervisor comes up
    pub initial_workers: usize,

    /// Disk utilisation (percent) considered saturated
    pub saturated_util_pct: f64,

    /// Disk utilisation (percent) below which the fleet may grow
    pub normal_util_pct: f64,

    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,

    /// Catalog ids per worker slice; 0 runs every worker unbounded
    pub slice_size: i64,

    /// Grace period between SIGTERM and SIGKILL
    pub kill_grace_secs: u64,

    /// A completion this soon after start with nothing found suppresses
    /// the at-least-one-worker fallback
    pub empty_completion_window_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            worker_binary: PathBuf::from("migration-worker"),
            worker_args: Vec::new(),
            patch_root: None,
            disk_device: None,
            metrics_file: None,
            cycle_interval_secs: 30,
            activity_tail_bytes: 256 * 1024,
            upload_stuck_secs: 30 * 60,
            discovery_stuck_secs: 60 * 60,
            progress_window_secs: 10 * 60,
            error_rate_threshold: 0.5,
            fix_cooldown_secs: 15 * 60,
            max_fix_attempts: 3,
            fix_window_secs: 24 * 60 * 60,
            verify_window_secs: 10 * 60,
            max_backoff_cycles: 32,
            escalation: Escalation::PauseAndAlert,
            recurring_cause_threshold: 3,
            recurring_cause_similarity: 0.6,
            fix_history_max: 500,
            advisor_command: None,
            advisor_timeout_secs: 120,
            patch_validator: None,
            min_workers: 1,
            max_workers: 8,
            initial_workers: 1,
            saturated_util_pct: 90.0,
            normal_util_pct: 60.0,
            scale_up_cooldown_secs: 5 * 60,
            scale_down_cooldown_secs: 10 * 60,
            slice_size: 0,
            kill_grace_secs: 15,
            empty_completion_window_secs: 5 * 60,
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from a JSON file
    ///
    /// Fields marked "not reloadable" are never read from the file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Copy every reloadable field from `other`
    pub fn merge_reloadable(&mut self, other: &SupervisorConfig) {
        let keep = (
            std::mem::take(&mut self.state_dir),
            std::mem::take(&mut self.worker_binary),
            std::mem::take(&mut self.worker_args),
            self.patch_root.take(),
            self.disk_device.take(),
            self.metrics_file.take(),
        );
        *self = other.clone();
        (
            self.state_dir,
            self.worker_binary,
            self.worker_args,
            self.patch_root,
            self.disk_device,
            self.metrics_file,
        ) = keep;
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.min_workers > self.max_workers {
            return Err(format!(
                "min_workers {} exceeds max_workers {}",
                self.min_workers, self.max_workers
            ));
        }
        if self.normal_util_pct > self.saturated_util_pct {
            return Err("normal_util_pct must not exceed saturated_util_pct".to_string());
        }
        if !(0.0..=1.0).contains(&self.recurring_cause_similarity) {
            return Err("recurring_cause_similarity must be within 0..=1".to_string());
        }
        if self.cycle_interval_secs == 0 {
            return Err("cycle_interval_secs must be > 0".to_string());
        }
        if self.slice_size < 0 {
            return Err("slice_size must be >= 0".to_string());
        }
        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    /// Worker count the fleet starts with, within bounds
    pub fn initial_desired(&self) -> usize {
        self.initial_workers.clamp(self.min_workers, self.max_workers)
    }

    /// Start watching for SIGUSR1 to reload config from file
    ///
    /// When SIGUSR1 is received, the config file is re-read and the merged
    /// configuration is sent to the control loop via the watch channel.
    #[cfg(unix)]
    pub async fn start_config_watcher(
        config_file: PathBuf,
        current_config: Self,
        config_tx: watch::Sender<Self>,
    ) {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigusr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to register SIGUSR1 handler");
                return;
            }
        };

        let mut config = current_config;

        loop {
            sigusr1.recv().await;
            tracing::info!(
                config_file = %config_file.display(),
                "Received SIGUSR1, reloading config"
            );

            let new_config = match Self::from_file(&config_file).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to reload config");
                    continue;
                }
            };
            let mut merged = config.clone();
            merged.merge_reloadable(&new_config);
            if let Err(e) = merged.validate() {
                tracing::error!(error = %e, "Reloaded config is invalid, keeping the old one");
                continue;
            }
            config = merged;

            if config_tx.send(config.clone()).is_err() {
                tracing::warn!("No config subscribers, reload had no effect");
                return;
            }
            tracing::info!(
                min_workers = config.min_workers,
                max_workers = config.max_workers,
                escalation = ?config.escalation,
                "Config reloaded successfully"
            );
        }
    }
}
