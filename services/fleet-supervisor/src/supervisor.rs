// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Supervisor control loop
//!
//! One cycle: consume operator resets, observe and assess every worker,
//! remediate the least healthy first, run the autoscaler against the disk
//! sample, then publish `fleet-status.json` and metrics.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use migration_types::WorkerFiles;

use crate::advisor::{CommandAdvisor, FixAdvisor, HeuristicAdvisor};
use crate::autoscaler::{Autoscaler, ScaleInputs};
use crate::config::SupervisorConfig;
use crate::diskio::DiskIoSource;
use crate::health::{self, Assessment, HealthTrend, WarningLevel, WorkerState};
use crate::history::HistoryError;
use crate::metrics;
use crate::observe::{self, Observation};
use crate::process::WorkerLauncher;
use crate::remediation::{Decision, RemediationController, RemediationState};

pub const FLEET_STATUS_FILE: &str = "fleet-status.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: u32,
    pub state: WorkerState,
    pub score: f64,
    /// Score change over the trend window
    pub trend: Option<f64>,
    pub remediation: RemediationState,
    pub running: bool,
    pub cursor: i64,
    pub completed_items: usize,
    pub idle_secs: Option<u64>,
    pub threshold_secs: u64,
    pub warning: Option<WarningLevel>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FleetStatus {
    pub updated_at: DateTime<Utc>,
    pub desired_workers: usize,
    pub running_workers: Vec<u32>,
    pub disk_utilization: Option<f64>,
    pub workers: Vec<WorkerStatus>,
}

impl FleetStatus {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(FLEET_STATUS_FILE)
    }

    pub fn load(state_dir: &Path) -> anyhow::Result<Self> {
        let path = Self::path(state_dir);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn write(&self, state_dir: &Path) -> std::io::Result<()> {
        let path = Self::path(state_dir);
        let text = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &path)
    }
}

pub fn build_advisor(config: &SupervisorConfig) -> Arc<dyn FixAdvisor> {
    match &config.advisor_command {
        Some(cmd) => Arc::new(CommandAdvisor::new(
            cmd.clone(),
            Duration::from_secs(config.advisor_timeout_secs),
        )),
        None => Arc::new(HeuristicAdvisor),
    }
}

/// Ids with a pending `worker-<id>.reset` marker
fn reset_markers(state_dir: &Path) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir(state_dir) else {
        return Vec::new();
    };
    let mut ids: Vec<u32> = entries
        .flatten()
        .filter_map(|e| {
            e.file_name()
                .to_str()?
                .strip_prefix("worker-")?
                .strip_suffix(".reset")?
                .parse()
                .ok()
        })
        .collect();
    ids.sort_unstable();
    ids
}

pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    disk: Arc<dyn DiskIoSource>,
    remediation: RemediationController,
    autoscaler: Autoscaler,
    trend: HealthTrend,
    warned: HashMap<u32, WarningLevel>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        disk: Arc<dyn DiskIoSource>,
    ) -> Result<Self, HistoryError> {
        let remediation = RemediationController::open(&config, build_advisor(&config))?;
        Ok(Self {
            autoscaler: Autoscaler::new(config.initial_desired()),
            config,
            launcher,
            disk,
            remediation,
            trend: HealthTrend::default(),
            warned: HashMap::new(),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn desired(&self) -> usize {
        self.autoscaler.desired()
    }

    pub fn apply_config(&mut self, config: SupervisorConfig) {
        self.remediation
            .reconfigure(&config, build_advisor(&config));
        self.config = config;
        tracing::info!(
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            "Applied new configuration"
        );
    }

    fn consume_resets(&mut self, now: DateTime<Utc>) {
        for id in reset_markers(&self.config.state_dir) {
            self.remediation.reset(id, now);
            self.warned.remove(&id);
            let marker = WorkerFiles::new(&self.config.state_dir, id).reset_marker();
            if let Err(e) = std::fs::remove_file(&marker) {
                tracing::warn!(worker_id = id, error = %e, "Cannot remove reset marker");
            }
        }
    }

    fn note_warning(&mut self, a: &Assessment, utilization: Option<f64>) {
        let Some(level) = a.warning else {
            self.warned.remove(&a.worker_id);
            return;
        };
        if self.warned.get(&a.worker_id).is_some_and(|prev| *prev >= level) {
            return;
        }
        self.warned.insert(a.worker_id, level);
        let idle_secs = a.idle.map(|d| d.as_secs());
        match level {
            WarningLevel::Early => tracing::info!(
                worker_id = a.worker_id,
                idle_secs,
                threshold_secs = a.threshold.as_secs(),
                "Worker approaching stuck threshold"
            ),
            WarningLevel::Critical => tracing::warn!(
                worker_id = a.worker_id,
                idle_secs,
                threshold_secs = a.threshold.as_secs(),
                disk_utilization = ?utilization,
                "Worker close to stuck threshold"
            ),
        }
    }

    /// Run one control cycle.
    pub async fn cycle(&mut self, now: DateTime<Utc>) -> FleetStatus {
        let state_dir = self.config.state_dir.clone();
        self.consume_resets(now);

        let running = self.launcher.running().await;
        let known = observe::discover_worker_ids(&state_dir).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Cannot list state directory");
            BTreeSet::new()
        });
        let progress_window = ChronoDuration::seconds(self.config.progress_window_secs as i64);

        let mut observations: HashMap<u32, Observation> = HashMap::new();
        let mut assessments = Vec::new();
        for id in known.union(&running) {
            let files = WorkerFiles::new(&state_dir, *id);
            let obs = match observe::observe(
                &files,
                self.config.activity_tail_bytes,
                now,
                progress_window,
            )
            .await
            {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!(worker_id = id, error = %e, "Cannot observe worker");
                    continue;
                }
            };
            let assessment = health::assess(&obs, now, &self.config);
            self.trend.record(*id, assessment.score.total);
            metrics::set_health_score(*id, assessment.score.total);
            observations.insert(*id, obs);
            assessments.push(assessment);
        }
        health::worst_first(&mut assessments);

        // Sampled once per cycle; the sampler measures since the last call.
        let utilization = self.disk.utilization().await;
        metrics::set_disk_utilization(utilization);

        for a in &assessments {
            self.note_warning(a, utilization);
            if a.state == WorkerState::Stuck {
                metrics::record_stuck();
                tracing::warn!(
                    worker_id = a.worker_id,
                    score = a.score.total,
                    idle_secs = a.idle.map(|d| d.as_secs()),
                    threshold_secs = a.threshold.as_secs(),
                    "Worker stuck"
                );
            }
            if !running.contains(&a.worker_id) {
                continue;
            }
            let Some(obs) = observations.get(&a.worker_id) else {
                continue;
            };
            let decision = self
                .remediation
                .handle(a, obs, self.launcher.as_ref(), now, &self.config)
                .await;
            if !matches!(decision, Decision::Healthy) {
                tracing::debug!(worker_id = a.worker_id, ?decision, "Remediation");
            }
        }

        let running = self.launcher.running().await;
        let empty_window = ChronoDuration::seconds(self.config.empty_completion_window_secs as i64);
        let inputs = ScaleInputs {
            utilization,
            running: running.clone(),
            known: known.clone(),
            stuck: assessments
                .iter()
                .filter(|a| a.state == WorkerState::Stuck && running.contains(&a.worker_id))
                .map(|a| a.worker_id)
                .collect(),
            orphans: observations
                .values()
                .filter(|o| o.has_checkpoint && !o.completed)
                .filter(|o| !running.contains(&o.worker_id))
                .filter(|o| !self.remediation.is_paused(o.worker_id))
                .map(|o| o.worker_id)
                .collect(),
            completed: observations
                .values()
                .filter(|o| o.completed)
                .map(|o| o.worker_id)
                .collect(),
            paused: known
                .iter()
                .copied()
                .filter(|id| self.remediation.is_paused(*id))
                .collect(),
            recent_empty_completion: observations.values().any(|o| {
                o.completed_empty && o.completed_at.is_some_and(|t| now - t <= empty_window)
            }),
        };

        let before = self.autoscaler.desired();
        let plan = self.autoscaler.plan(&inputs, &self.config, now);
        if let Some(id) = plan.kill {
            match self.launcher.terminate(id).await {
                Ok(true) => tracing::info!(worker_id = id, "Worker stopped for scale-down"),
                Ok(false) => {
                    tracing::error!(worker_id = id, "Scale-down kill not confirmed");
                    self.autoscaler.revert_scale_down();
                }
                Err(e) => {
                    tracing::error!(worker_id = id, error = %e, "Scale-down kill failed");
                    self.autoscaler.revert_scale_down();
                }
            }
        }
        for id in &plan.spawn {
            if let Err(e) = self.launcher.spawn(*id).await {
                tracing::error!(worker_id = id, error = %e, "Failed to start worker");
                if plan.desired > before && !known.contains(id) {
                    self.autoscaler.revert_scale_up();
                }
            }
        }

        let running = self.launcher.running().await;
        let desired = self.autoscaler.desired();
        metrics::set_fleet(running.len(), desired);

        let workers = assessments
            .iter()
            .map(|a| {
                let obs = observations.get(&a.worker_id);
                WorkerStatus {
                    worker_id: a.worker_id,
                    state: a.state,
                    score: a.score.total,
                    trend: self.trend.trend(a.worker_id),
                    remediation: self.remediation.state(a.worker_id),
                    running: running.contains(&a.worker_id),
                    cursor: obs.map_or(0, |o| o.cursor),
                    completed_items: obs.map_or(0, |o| o.completed_items),
                    idle_secs: a.idle.map(|d| d.as_secs()),
                    threshold_secs: a.threshold.as_secs(),
                    warning: a.warning,
                }
            })
            .collect();
        let status = FleetStatus {
            updated_at: now,
            desired_workers: desired,
            running_workers: running.into_iter().collect(),
            disk_utilization: utilization,
            workers,
        };

        if let Err(e) = status.write(&state_dir) {
            tracing::error!(error = %e, "Cannot write fleet status");
        }
        if let Some(path) = &self.config.metrics_file {
            if let Err(e) = metrics::write_textfile(path) {
                tracing::warn!(path = %path.display(), error = %e, "Cannot write metrics");
            }
        }
        status
    }

    /// Run cycles until shutdown. With `once`, a single cycle runs.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        mut config_rx: watch::Receiver<SupervisorConfig>,
        once: bool,
    ) {
        let mut config_open = true;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let status = self.cycle(Utc::now()).await;
            tracing::info!(
                desired = status.desired_workers,
                running = status.running_workers.len(),
                disk_utilization = ?status.disk_utilization,
                "Cycle complete"
            );
            if once {
                break;
            }

            let sleep = tokio::time::sleep(self.config.cycle_interval());
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            tracing::info!("Shutdown requested, leaving workers running");
                            return;
                        }
                    }
                    res = config_rx.changed(), if config_open => {
                        match res {
                            Ok(()) => {
                                let config = config_rx.borrow_and_update().clone();
                                self.apply_config(config);
                            }
                            Err(_) => config_open = false,
                        }
                    }
                }
            }
        }
    }
}

/// Resolves on SIGTERM or ctrl-c
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {},
                        _ = term.recv() => {},
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;

        let _ = tx.send(true);
        tx.closed().await;
    });
    rx
}
