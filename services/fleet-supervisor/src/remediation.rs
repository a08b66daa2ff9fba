// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Remediation controller
//!
//! Per worker: `idle → cooldown → eligible → fix-applied → verifying →
//! (resolved | still-stuck)`, plus `paused` once the fix budget is spent.
//!
//! Cooldown, the attempt budget and the last fix time come from the fix
//! history and the operator reset log, so they survive a supervisor
//! restart. Backoff, pauses and pending verifications are held in memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use migration_types::{Fix, FixAttemptRecord, FixType, WorkerFiles, WorkerParams};

use crate::advisor::{Advice, AdviceContext, FixAdvisor};
use crate::config::{Escalation, SupervisorConfig};
use crate::health::{Assessment, WorkerState};
use crate::history::{FixHistory, HistoryError, OperatorResets, RootCauseLedger};
use crate::metrics;
use crate::observe::Observation;
use crate::patch::SourcePatcher;
use crate::process::WorkerLauncher;

pub const ALERT_LOG_FILE: &str = "alerts.log";

/// Fix records handed to the advisor as context
const RECENT_FIXES_FOR_ADVICE: usize = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemediationState {
    #[default]
    Idle,
    Cooldown,
    Eligible,
    FixApplied,
    Verifying,
    Resolved,
    StillStuck,
    Paused,
}

/// Outcome of one [`RemediationController::handle`] call
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Worker is not stuck; nothing to do
    Healthy,
    /// A fix is applied and its verification window is still open
    Verifying,
    Paused,
    /// Skipping this cycle because recent fixes did not help
    Backoff { remaining: u32 },
    Cooldown { remaining: Duration },
    Applied { fix_type: FixType, root_cause: String },
    /// The fix could not be applied; the attempt still counts
    Failed { fix_type: FixType, error: String },
    Escalated(Escalation),
}

#[derive(Clone, Debug)]
struct PendingVerification {
    recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
struct WorkerRemediation {
    state: RemediationState,
    last_fix_at: Option<DateTime<Utc>>,
    paused: bool,
    skip_cycles: u32,
    backoff_level: u32,
    pending: Option<PendingVerification>,
    deferred_used: bool,
    /// Fixes at or before this time no longer count against the budget
    budget_floor: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct Alert<'a> {
    ts: DateTime<Utc>,
    worker_id: u32,
    action: Escalation,
    attempts: usize,
    reason: &'a str,
    root_cause: Option<&'a str>,
}

/// Append-only JSON-lines alert sink
#[derive(Clone, Debug)]
pub struct AlertLog {
    path: PathBuf,
}

impl AlertLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(ALERT_LOG_FILE),
        }
    }

    fn append(&self, alert: &Alert<'_>) {
        use std::io::Write;

        let line = match serde_json::to_string(alert) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, "Cannot encode alert");
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = result {
            tracing::error!(path = %self.path.display(), error = %e, "Cannot write alert");
        }
    }
}

fn read_params(files: &WorkerFiles) -> WorkerParams {
    std::fs::read_to_string(files.params())
        .ok()
        .and_then(|t| serde_json::from_str(&t).ok())
        .unwrap_or_default()
}

fn write_params(files: &WorkerFiles, params: &WorkerParams) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(params).map_err(std::io::Error::other)?;
    let path = files.params();
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, &path)
}

fn to_std(d: ChronoDuration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

pub struct RemediationController {
    state_dir: PathBuf,
    history: FixHistory,
    ledger: RootCauseLedger,
    resets: OperatorResets,
    advisor: Arc<dyn FixAdvisor>,
    patcher: SourcePatcher,
    alerts: AlertLog,
    workers: HashMap<u32, WorkerRemediation>,
}

impl RemediationController {
    pub fn open(
        config: &SupervisorConfig,
        advisor: Arc<dyn FixAdvisor>,
    ) -> Result<Self, HistoryError> {
        Ok(Self {
            state_dir: config.state_dir.clone(),
            history: FixHistory::open(&config.state_dir, config.fix_history_max)?,
            ledger: RootCauseLedger::open(&config.state_dir, config.recurring_cause_similarity)?,
            resets: OperatorResets::open(&config.state_dir)?,
            advisor,
            patcher: SourcePatcher::new(config.patch_root.clone(), config.patch_validator.clone()),
            alerts: AlertLog::new(&config.state_dir),
            workers: HashMap::new(),
        })
    }

    pub fn history(&self) -> &FixHistory {
        &self.history
    }

    pub fn ledger(&self) -> &RootCauseLedger {
        &self.ledger
    }

    /// Apply the reloadable parts of a new configuration.
    pub fn reconfigure(&mut self, config: &SupervisorConfig, advisor: Arc<dyn FixAdvisor>) {
        self.history.set_max_len(config.fix_history_max);
        self.ledger.set_similarity(config.recurring_cause_similarity);
        self.patcher.set_validator(config.patch_validator.clone());
        self.advisor = advisor;
    }

    pub fn state(&self, worker_id: u32) -> RemediationState {
        self.workers
            .get(&worker_id)
            .map(|w| w.state)
            .unwrap_or_default()
    }

    pub fn is_paused(&self, worker_id: u32) -> bool {
        self.workers.get(&worker_id).is_some_and(|w| w.paused)
    }

    /// Operator reset: clear the pause, backoff and budget of a worker.
    pub fn reset(&mut self, worker_id: u32, now: DateTime<Utc>) {
        if let Err(e) = self.resets.record(worker_id, now) {
            tracing::error!(worker_id, error = %e, "Cannot persist operator reset");
        }
        self.workers.insert(
            worker_id,
            WorkerRemediation {
                last_fix_at: self.history.last_for_worker(worker_id).map(|r| r.timestamp),
                budget_floor: Some(now),
                ..Default::default()
            },
        );
        tracing::info!(worker_id, "Remediation state reset by operator");
    }

    /// Fixes that count against the budget at `now`
    fn attempts(
        &self,
        worker_id: u32,
        floor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        config: &SupervisorConfig,
    ) -> usize {
        let window_start = now - ChronoDuration::seconds(config.fix_window_secs as i64);
        let verified_floor = self
            .history
            .for_worker(worker_id)
            .filter(|r| r.verified_success == Some(true))
            .map(|r| r.timestamp)
            .max();
        let floor = floor.max(verified_floor);
        self.history
            .for_worker(worker_id)
            .filter(|r| r.timestamp > window_start)
            .filter(|r| floor.is_none_or(|f| r.timestamp > f))
            .count()
    }

    fn seed(&self, worker_id: u32) -> WorkerRemediation {
        WorkerRemediation {
            last_fix_at: self.history.last_for_worker(worker_id).map(|r| r.timestamp),
            budget_floor: self.resets.last(worker_id),
            ..Default::default()
        }
    }

    /// Run one control step for a worker.
    ///
    /// Must be called every cycle for every running worker, stuck or not,
    /// so that pending verifications complete.
    pub async fn handle(
        &mut self,
        assessment: &Assessment,
        obs: &Observation,
        launcher: &dyn WorkerLauncher,
        now: DateTime<Utc>,
        config: &SupervisorConfig,
    ) -> Decision {
        let id = assessment.worker_id;
        let mut w = match self.workers.remove(&id) {
            Some(w) => w,
            None => self.seed(id),
        };
        let decision = self.step(&mut w, assessment, obs, launcher, now, config).await;
        self.workers.insert(id, w);
        decision
    }

    async fn step(
        &mut self,
        w: &mut WorkerRemediation,
        assessment: &Assessment,
        obs: &Observation,
        launcher: &dyn WorkerLauncher,
        now: DateTime<Utc>,
        config: &SupervisorConfig,
    ) -> Decision {
        let id = assessment.worker_id;
        let stuck = assessment.state == WorkerState::Stuck;

        if let Some(pending) = w.pending.clone() {
            let elapsed = now - pending.recorded_at;
            if elapsed < ChronoDuration::seconds(config.verify_window_secs as i64) {
                w.state = RemediationState::Verifying;
                return Decision::Verifying;
            }
            let moved = obs.last_upload.is_some_and(|t| t > pending.recorded_at)
                || obs.last_progress.is_some_and(|t| t > pending.recorded_at);
            let success = !stuck && moved;
            w.pending = None;
            if let Err(e) = self.history.set_verified(id, pending.recorded_at, success) {
                tracing::error!(worker_id = id, error = %e, "Cannot record verification");
            }
            metrics::record_verification(success);

            if success {
                tracing::info!(worker_id = id, "Fix verified, worker resolved");
                *w = WorkerRemediation {
                    state: RemediationState::Resolved,
                    last_fix_at: w.last_fix_at,
                    budget_floor: Some(pending.recorded_at),
                    ..Default::default()
                };
            } else {
                w.backoff_level = w.backoff_level.saturating_add(1);
                w.skip_cycles = 2u32
                    .saturating_pow(w.backoff_level)
                    .min(config.max_backoff_cycles);
                w.state = RemediationState::StillStuck;
                tracing::warn!(
                    worker_id = id,
                    backoff_level = w.backoff_level,
                    skip_cycles = w.skip_cycles,
                    "Fix did not resolve worker"
                );
            }
        }

        if !stuck {
            if !w.paused && w.state != RemediationState::Resolved {
                w.state = RemediationState::Idle;
            }
            return Decision::Healthy;
        }

        if w.paused {
            w.state = RemediationState::Paused;
            return Decision::Paused;
        }

        if w.skip_cycles > 0 {
            w.skip_cycles -= 1;
            return Decision::Backoff {
                remaining: w.skip_cycles,
            };
        }

        if let Some(last) = w.last_fix_at {
            let cooldown = ChronoDuration::seconds(config.fix_cooldown_secs as i64);
            if now - last < cooldown {
                w.state = RemediationState::Cooldown;
                let remaining = to_std(cooldown - (now - last));
                tracing::debug!(worker_id = id, ?remaining, "Stuck worker in cooldown");
                return Decision::Cooldown { remaining };
            }
        }

        let attempts = self.attempts(id, w.budget_floor, now, config);
        let mut avoid_restart = false;
        if attempts >= config.max_fix_attempts {
            match config.escalation {
                Escalation::DeferToAlternateFix if !w.deferred_used => {
                    w.deferred_used = true;
                    avoid_restart = true;
                    tracing::warn!(worker_id = id, attempts, "Fix budget spent, trying an alternate fix");
                }
                action => {
                    let root_cause = self.history.last_for_worker(id).map(|r| r.root_cause.clone());
                    return self
                        .escalate(w, id, attempts, action, "fix budget spent", root_cause, launcher)
                        .await;
                }
            }
        }

        w.state = RemediationState::Eligible;
        let files = WorkerFiles::new(&self.state_dir, id);
        let mut ctx = AdviceContext {
            worker_id: id,
            phase: obs.phase,
            idle_secs: assessment.idle.map_or(0, |d| d.as_secs()),
            threshold_secs: assessment.threshold.as_secs(),
            error_rate: obs.error_rate(),
            recent_errors: obs.recent_errors.clone(),
            params: read_params(&files),
            recent_fixes: self.recent_fixes(id),
            avoid_restart,
        };
        let mut advice = self.advisor.advise(&ctx).await;

        if !ctx.avoid_restart && matches!(advice.fix, Fix::Restart { .. }) {
            let prior = self.ledger.occurrences(&advice.root_cause);
            if prior >= config.recurring_cause_threshold {
                tracing::warn!(
                    worker_id = id,
                    root_cause = %advice.root_cause,
                    prior,
                    "Recurring root cause, asking for a fix other than restart"
                );
                ctx.avoid_restart = true;
                advice = self.advisor.advise(&ctx).await;
            }
        }

        if ctx.avoid_restart && matches!(advice.fix, Fix::Restart { .. }) {
            return self
                .escalate(
                    w,
                    id,
                    attempts,
                    Escalation::PauseAndAlert,
                    "no alternative to another restart",
                    Some(advice.root_cause),
                    launcher,
                )
                .await;
        }

        self.apply(w, id, &ctx.params, advice, launcher, now).await
    }

    fn recent_fixes(&self, worker_id: u32) -> Vec<FixAttemptRecord> {
        let mut fixes: Vec<_> = self.history.for_worker(worker_id).cloned().collect();
        let skip = fixes.len().saturating_sub(RECENT_FIXES_FOR_ADVICE);
        fixes.drain(..skip);
        fixes
    }

    async fn restart(&self, id: u32, launcher: &dyn WorkerLauncher) -> Result<(), String> {
        match launcher.terminate(id).await {
            Ok(true) => {}
            Ok(false) => return Err("worker did not exit".to_string()),
            Err(e) => return Err(e.to_string()),
        }
        launcher.spawn(id).await.map(|_| ()).map_err(|e| e.to_string())
    }

    async fn apply(
        &mut self,
        w: &mut WorkerRemediation,
        id: u32,
        current: &WorkerParams,
        advice: Advice,
        launcher: &dyn WorkerLauncher,
        now: DateTime<Utc>,
    ) -> Decision {
        let files = WorkerFiles::new(&self.state_dir, id);
        let mut fix_type = advice.fix.fix_type();

        let result = match &advice.fix {
            Fix::Restart { params } | Fix::ConfigChange { params } => {
                let write = if params.is_empty() {
                    Ok(())
                } else {
                    write_params(&files, &current.merge(params))
                        .map_err(|e| format!("writing params: {}", e))
                };
                match write {
                    Ok(()) => self.restart(id, launcher).await,
                    Err(e) => Err(e),
                }
            }
            Fix::SourcePatch { location, content } => {
                match self.patcher.apply(location, content).await {
                    Ok(_) => self.restart(id, launcher).await,
                    Err(e) => {
                        tracing::warn!(
                            worker_id = id,
                            error = %e,
                            "Source patch rejected, falling back to restart"
                        );
                        metrics::record_fix(&FixType::SourcePatch.to_string(), false);
                        fix_type = FixType::Restart;
                        self.restart(id, launcher).await
                    }
                }
            }
        };

        let success = result.is_ok();
        metrics::record_fix(&fix_type.to_string(), success);
        let record = FixAttemptRecord {
            worker_id: id,
            timestamp: now,
            fix_type,
            root_cause: advice.root_cause.clone(),
            confidence: advice.confidence,
            success,
            verified_success: None,
        };
        if let Err(e) = self.history.append(record) {
            tracing::error!(worker_id = id, error = %e, "Cannot append fix history");
        }
        if let Err(e) = self.ledger.record(&advice.root_cause, now) {
            tracing::error!(worker_id = id, error = %e, "Cannot update root-cause ledger");
        }
        w.last_fix_at = Some(now);

        match result {
            Ok(()) => {
                tracing::info!(
                    worker_id = id,
                    %fix_type,
                    root_cause = %advice.root_cause,
                    confidence = advice.confidence,
                    "Fix applied"
                );
                w.pending = Some(PendingVerification { recorded_at: now });
                w.state = RemediationState::FixApplied;
                Decision::Applied {
                    fix_type,
                    root_cause: advice.root_cause,
                }
            }
            Err(error) => {
                tracing::error!(worker_id = id, %fix_type, %error, "Fix failed");
                w.state = RemediationState::StillStuck;
                Decision::Failed { fix_type, error }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn escalate(
        &mut self,
        w: &mut WorkerRemediation,
        id: u32,
        attempts: usize,
        action: Escalation,
        reason: &str,
        root_cause: Option<String>,
        launcher: &dyn WorkerLauncher,
    ) -> Decision {
        tracing::error!(
            worker_id = id,
            attempts,
            ?action,
            reason,
            root_cause = root_cause.as_deref().unwrap_or("unknown"),
            "Escalating stuck worker"
        );

        if action == Escalation::HardStop {
            match launcher.terminate(id).await {
                Ok(true) => {}
                Ok(false) => tracing::error!(worker_id = id, "Hard stop: worker did not exit"),
                Err(e) => tracing::error!(worker_id = id, error = %e, "Hard stop failed"),
            }
        }

        self.alerts.append(&Alert {
            ts: Utc::now(),
            worker_id: id,
            action,
            attempts,
            reason,
            root_cause: root_cause.as_deref(),
        });
        metrics::record_escalation(match action {
            Escalation::PauseAndAlert => "pause_and_alert",
            Escalation::HardStop => "hard_stop",
            Escalation::DeferToAlternateFix => "defer_to_alternate_fix",
        });

        w.paused = true;
        w.state = RemediationState::Paused;
        Decision::Escalated(action)
    }
}
