// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Health scoring and stuck detection
//!
//! A worker's score (0-100) is a weighted sum of four sub-scores, each in
//! `0.0..=1.0`:
//!
//! | Sub-score         | Weight | Full marks when                          |
//! |-------------------|--------|------------------------------------------|
//! | upload recency    | 0.35   | an upload just happened                  |
//! | error rate        | 0.20   | no errors in the current run             |
//! | progress rate     | 0.25   | enough progress signals in the window    |
//! | activity recency  | 0.20   | the activity log was just written        |
//!
//! Stuck classification is separate from the score. A worker with a
//! positive progress sub-score is never stuck, and a worker churning
//! through an all-duplicate range is exempt.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use migration_types::Phase;

use crate::config::SupervisorConfig;
use crate::observe::Observation;

pub const WEIGHT_UPLOAD_RECENCY: f64 = 0.35;
pub const WEIGHT_ERROR_RATE: f64 = 0.20;
pub const WEIGHT_PROGRESS_RATE: f64 = 0.25;
pub const WEIGHT_ACTIVITY_RECENCY: f64 = 0.20;

/// Progress signals in the window that earn a full progress sub-score
pub const PROGRESS_SIGNALS_FOR_FULL: usize = 5;

/// Scores kept per worker for the trend
pub const TREND_WINDOW: usize = 10;

/// Early-warning tiers as fractions of the stuck threshold
pub const EARLY_WARNING: f64 = 0.67;
pub const CRITICAL_WARNING: f64 = 0.83;

/// Errors needed before a run can be classified as failing
const MIN_ERRORS_FOR_ERROR_STATE: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
    Discovering,
    Uploading,
    ProcessingDuplicates,
    Stuck,
    Completed,
    Error,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Discovering => "discovering",
            WorkerState::Uploading => "uploading",
            WorkerState::ProcessingDuplicates => "processing-duplicates",
            WorkerState::Stuck => "stuck",
            WorkerState::Completed => "completed",
            WorkerState::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    Early,
    Critical,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    pub upload_recency: f64,
    pub error_rate: f64,
    pub progress_rate: f64,
    pub activity_recency: f64,
    pub total: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Assessment {
    pub worker_id: u32,
    pub state: WorkerState,
    pub score: HealthScore,
    pub threshold: Duration,
    /// Time since the last upload, or since the last progress signal for a
    /// worker that has not uploaded yet
    pub idle: Option<Duration>,
    pub warning: Option<WarningLevel>,
}

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

fn recency(now: DateTime<Utc>, since: Option<DateTime<Utc>>, horizon: Duration) -> f64 {
    match since {
        Some(t) if !horizon.is_zero() => {
            1.0 - (elapsed(now, t).as_secs_f64() / horizon.as_secs_f64()).min(1.0)
        }
        _ => 0.0,
    }
}

/// Stuck threshold for this worker.
///
/// Discovery gets the longer threshold. The result is shortened by 25% for
/// an error-heavy run and stretched by 50% for a run that uploads, but
/// slower than one item an hour (very large files).
pub fn stuck_threshold(obs: &Observation, config: &SupervisorConfig) -> Duration {
    let discovering = !obs.has_uploaded() || obs.phase == Some(Phase::Discovering);
    let mut threshold = Duration::from_secs(if discovering {
        config.discovery_stuck_secs
    } else {
        config.upload_stuck_secs
    });

    if obs.error_rate() > config.error_rate_threshold {
        threshold = threshold.mul_f64(0.75);
    }
    if obs.upload_rate > 0.0 && obs.upload_rate < 1.0 {
        threshold = threshold.mul_f64(1.5);
    }
    threshold
}

pub fn score(obs: &Observation, now: DateTime<Utc>, threshold: Duration) -> HealthScore {
    let upload_recency = recency(now, obs.last_upload, threshold);
    let error_rate = 1.0 - obs.error_rate().min(1.0);
    let progress_rate =
        (obs.recent_progress as f64 / PROGRESS_SIGNALS_FOR_FULL as f64).min(1.0);
    let activity_recency = recency(now, obs.last_activity, threshold);

    let total = 100.0
        * (WEIGHT_UPLOAD_RECENCY * upload_recency
            + WEIGHT_ERROR_RATE * error_rate
            + WEIGHT_PROGRESS_RATE * progress_rate
            + WEIGHT_ACTIVITY_RECENCY * activity_recency);

    HealthScore {
        upload_recency,
        error_rate,
        progress_rate,
        activity_recency,
        total,
    }
}

fn phase_state(phase: Option<Phase>) -> WorkerState {
    match phase {
        Some(Phase::Uploading) => WorkerState::Uploading,
        Some(Phase::ProcessingDuplicates) => WorkerState::ProcessingDuplicates,
        Some(Phase::Discovering) | None => WorkerState::Discovering,
    }
}

/// Classify one worker.
pub fn assess(obs: &Observation, now: DateTime<Utc>, config: &SupervisorConfig) -> Assessment {
    let threshold = stuck_threshold(obs, config);
    let score = score(obs, now, threshold);

    let idle_since = obs
        .last_upload
        .or(obs.last_progress)
        .or(obs.started_at)
        .or(obs.last_activity);
    let idle = idle_since.map(|t| elapsed(now, t));

    let mut assessment = Assessment {
        worker_id: obs.worker_id,
        state: phase_state(obs.phase),
        score,
        threshold,
        idle,
        warning: None,
    };

    if obs.completed {
        assessment.state = WorkerState::Completed;
        return assessment;
    }
    if score.progress_rate > 0.0 {
        return assessment;
    }
    if obs.phase == Some(Phase::ProcessingDuplicates) {
        return assessment;
    }

    let Some(idle) = idle else {
        return assessment;
    };
    if idle >= threshold {
        assessment.state = WorkerState::Stuck;
        return assessment;
    }

    if obs.errors >= MIN_ERRORS_FOR_ERROR_STATE && obs.error_rate() > config.error_rate_threshold
    {
        assessment.state = WorkerState::Error;
    }

    let fraction = idle.as_secs_f64() / threshold.as_secs_f64().max(1.0);
    assessment.warning = if fraction >= CRITICAL_WARNING {
        Some(WarningLevel::Critical)
    } else if fraction >= EARLY_WARNING {
        Some(WarningLevel::Early)
    } else {
        None
    };
    assessment
}

/// Order assessments so the least healthy come first: stuck workers, then
/// ascending score.
pub fn worst_first(assessments: &mut [Assessment]) {
    assessments.sort_by(|a, b| {
        let a_stuck = a.state == WorkerState::Stuck;
        let b_stuck = b.state == WorkerState::Stuck;
        b_stuck
            .cmp(&a_stuck)
            .then(a.score.total.total_cmp(&b.score.total))
            .then(a.worker_id.cmp(&b.worker_id))
    });
}

/// Short in-memory score history per worker
#[derive(Debug, Default)]
pub struct HealthTrend {
    scores: HashMap<u32, VecDeque<f64>>,
}

impl HealthTrend {
    pub fn record(&mut self, worker_id: u32, total: f64) {
        let window = self.scores.entry(worker_id).or_default();
        window.push_back(total);
        while window.len() > TREND_WINDOW {
            window.pop_front();
        }
    }

    /// Change between the oldest and newest score in the window
    pub fn trend(&self, worker_id: u32) -> Option<f64> {
        let window = self.scores.get(&worker_id)?;
        Some(window.back()? - window.front()?)
    }

    pub fn scores(&self, worker_id: u32) -> Vec<f64> {
        self.scores
            .get(&worker_id)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn forget(&mut self, worker_id: u32) {
        self.scores.remove(&worker_id);
    }
}
