// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Worker observation
//!
//! Everything the supervisor knows about a worker comes from two files:
//! its checkpoint and the tail of its activity log. Neither is ever
//! written here.

use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use migration_types::{ActivityEvent, ActivityRecord, Checkpoint, ErrorClass, Phase, WorkerFiles};

/// Read at most the last `max_bytes` of `path`.
///
/// When the read starts mid-file the first (partial) line is dropped. A
/// missing file reads as empty.
pub async fn read_tail(path: &Path, max_bytes: u64) -> std::io::Result<String> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;
    let text = String::from_utf8_lossy(&buf).into_owned();

    if start > 0 {
        return Ok(match text.split_once('\n') {
            Some((_, rest)) => rest.to_string(),
            None => String::new(),
        });
    }
    Ok(text)
}

/// Worker ids with a checkpoint or activity log in `state_dir`.
pub fn discover_worker_ids(state_dir: &Path) -> std::io::Result<BTreeSet<u32>> {
    let mut ids = BTreeSet::new();
    let entries = match std::fs::read_dir(state_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let id = WorkerFiles::id_from_checkpoint_name(name).or_else(|| {
            name.strip_prefix("worker-")?
                .strip_suffix(".activity.log")?
                .parse()
                .ok()
        });
        ids.extend(id);
    }
    Ok(ids)
}

/// What the files say about one worker
#[derive(Clone, Debug, Default)]
pub struct Observation {
    pub worker_id: u32,
    /// Whether a checkpoint file exists
    pub has_checkpoint: bool,
    pub cursor: i64,
    pub completed_items: usize,

    /// Start of the current run, if seen in the tail
    pub started_at: Option<DateTime<Utc>>,
    pub last_upload: Option<DateTime<Utc>>,
    pub last_progress: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub phase: Option<Phase>,

    /// Progress signals inside the progress window
    pub recent_progress: usize,
    /// Uploads and errors over the whole tail of the current run
    pub uploads: usize,
    pub errors: usize,
    pub outcomes: usize,
    /// Uploads per hour over the current run
    pub upload_rate: f64,
    /// Most recent errors, newest last
    pub recent_errors: Vec<(ErrorClass, String)>,

    /// The current run logged `completed`
    pub completed: bool,
    /// The current run completed without finding a single catalog row
    pub completed_empty: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

const RECENT_ERRORS_KEPT: usize = 20;

impl Observation {
    /// Fraction of item outcomes in the current run that were errors
    pub fn error_rate(&self) -> f64 {
        if self.outcomes == 0 {
            0.0
        } else {
            self.errors as f64 / self.outcomes as f64
        }
    }

    pub fn has_uploaded(&self) -> bool {
        self.last_upload.is_some()
    }

    /// Fold activity records into an observation.
    ///
    /// Only records after the most recent `worker_started` count; earlier
    /// runs of the same worker are history.
    pub fn from_records(
        worker_id: u32,
        records: &[ActivityRecord],
        now: DateTime<Utc>,
        progress_window: ChronoDuration,
    ) -> Self {
        let run_start = records
            .iter()
            .rposition(|r| matches!(r.event, ActivityEvent::WorkerStarted { .. }))
            .unwrap_or(0);
        let run = &records[run_start..];

        let mut obs = Observation {
            worker_id,
            ..Default::default()
        };
        let mut rows_seen = 0usize;

        for record in run {
            let ts = record.ts;
            obs.last_activity = Some(obs.last_activity.map_or(ts, |t| t.max(ts)));
            if record.event.is_progress_signal() {
                obs.last_progress = Some(obs.last_progress.map_or(ts, |t| t.max(ts)));
                if now - ts <= progress_window {
                    obs.recent_progress += 1;
                }
            }

            match &record.event {
                ActivityEvent::WorkerStarted { .. } => {
                    obs.started_at = Some(ts);
                    obs.completed = false;
                }
                ActivityEvent::PhaseChanged { phase } => obs.phase = Some(*phase),
                ActivityEvent::QueryExecuted { rows, .. } => rows_seen += rows,
                ActivityEvent::UploadSucceeded { .. } => {
                    obs.last_upload = Some(ts);
                    obs.uploads += 1;
                    obs.outcomes += 1;
                }
                ActivityEvent::DuplicateSkipped { .. } | ActivityEvent::ItemSkipped { .. } => {
                    obs.outcomes += 1;
                }
                ActivityEvent::Error { class, message } => {
                    obs.errors += 1;
                    obs.outcomes += 1;
                    obs.recent_errors.push((*class, message.clone()));
                }
                ActivityEvent::Completed { .. } => {
                    obs.completed = true;
                    obs.completed_at = Some(ts);
                }
                _ => {}
            }
        }

        if obs.recent_errors.len() > RECENT_ERRORS_KEPT {
            let drop = obs.recent_errors.len() - RECENT_ERRORS_KEPT;
            obs.recent_errors.drain(..drop);
        }
        obs.completed_empty = obs.completed && rows_seen == 0;

        if let Some(start) = obs.started_at.or_else(|| run.first().map(|r| r.ts)) {
            let hours = (now - start).num_seconds().max(60) as f64 / 3600.0;
            obs.upload_rate = obs.uploads as f64 / hours;
        }
        obs
    }
}

/// Observe one worker.
pub async fn observe(
    files: &WorkerFiles,
    tail_bytes: u64,
    now: DateTime<Utc>,
    progress_window: ChronoDuration,
) -> std::io::Result<Observation> {
    let tail = read_tail(&files.activity_log(), tail_bytes).await?;
    let records = ActivityRecord::decode_all(&tail);
    let mut obs = Observation::from_records(files.id(), &records, now, progress_window);

    let checkpoint_text = match tokio::fs::read_to_string(files.checkpoint()).await {
        Ok(t) => Some(t),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };
    if let Some(text) = checkpoint_text {
        obs.has_checkpoint = true;
        // A checkpoint mid-replace may not decode; the next cycle will.
        match Checkpoint::decode(&text) {
            Ok(cp) => {
                obs.cursor = cp.cursor;
                obs.completed_items = cp.completed.len();
            }
            Err(e) => {
                tracing::debug!(worker_id = files.id(), error = %e, "Checkpoint not readable yet");
            }
        }
    }
    Ok(obs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + ChronoDuration::minutes(min)
    }

    fn rec(min: i64, event: ActivityEvent) -> ActivityRecord {
        ActivityRecord { ts: at(min), event }
    }

    #[test]
    fn test_only_current_run_counts() {
        let records = vec![
            rec(0, ActivityEvent::WorkerStarted {
                worker_id: 1,
                cursor: 0,
                end_cursor: None,
            }),
            rec(1, ActivityEvent::UploadSucceeded {
                path: "a".into(),
                hash: "h".into(),
                bytes: 1,
            }),
            rec(10, ActivityEvent::WorkerStarted {
                worker_id: 1,
                cursor: 5,
                end_cursor: None,
            }),
            rec(11, ActivityEvent::Error {
                class: ErrorClass::Server,
                message: "503".into(),
            }),
        ];
        let obs = Observation::from_records(1, &records, at(12), ChronoDuration::minutes(5));
        assert_eq!(obs.started_at, Some(at(10)));
        assert!(obs.last_upload.is_none());
        assert_eq!(obs.errors, 1);
        assert_eq!(obs.error_rate(), 1.0);
    }

    #[test]
    fn test_progress_window() {
        let records = vec![
            rec(0, ActivityEvent::QueryExecuted { cursor: 0, rows: 5 }),
            rec(8, ActivityEvent::FilesFound {
                candidates: 1,
                duplicates: 4,
            }),
            rec(9, ActivityEvent::PhaseChanged {
                phase: Phase::Uploading,
            }),
        ];
        let obs = Observation::from_records(0, &records, at(10), ChronoDuration::minutes(5));
        assert_eq!(obs.recent_progress, 1);
        assert_eq!(obs.last_progress, Some(at(8)));
        assert_eq!(obs.last_activity, Some(at(9)));
        assert_eq!(obs.phase, Some(Phase::Uploading));
    }

    #[test]
    fn test_empty_completion() {
        let records = vec![
            rec(0, ActivityEvent::WorkerStarted {
                worker_id: 2,
                cursor: 0,
                end_cursor: None,
            }),
            rec(0, ActivityEvent::Completed {
                cursor: 0,
                uploaded_total: 0,
            }),
        ];
        let obs = Observation::from_records(2, &records, at(1), ChronoDuration::minutes(5));
        assert!(obs.completed);
        assert!(obs.completed_empty);
    }

    #[tokio::test]
    async fn test_read_tail_drops_partial_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "first line\nsecond\nthird\n").unwrap();

        assert_eq!(read_tail(&path, 1024).await.unwrap(), "first line\nsecond\nthird\n");
        assert_eq!(read_tail(&path, 10).await.unwrap(), "third\n");
        assert_eq!(read_tail(&dir.path().join("none"), 10).await.unwrap(), "");
    }

    #[test]
    fn test_discover_worker_ids() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("worker-3.checkpoint.json"), "{}").unwrap();
        std::fs::write(dir.path().join("worker-5.activity.log"), "").unwrap();
        std::fs::write(dir.path().join("worker-9.pid"), "1").unwrap();
        std::fs::write(dir.path().join("fleet-status.json"), "{}").unwrap();

        let ids: Vec<u32> = discover_worker_ids(dir.path()).unwrap().into_iter().collect();
        assert_eq!(ids, vec![3, 5]);
    }

    #[tokio::test]
    async fn test_observe_reads_checkpoint() {
        let dir = tempdir().unwrap();
        let files = WorkerFiles::new(dir.path(), 4);
        let mut cp = Checkpoint::default();
        cp.cursor = 42;
        std::fs::write(files.checkpoint(), cp.encode().unwrap()).unwrap();

        let obs = observe(&files, 1024, at(0), ChronoDuration::minutes(5))
            .await
            .unwrap();
        assert!(obs.has_checkpoint);
        assert_eq!(obs.cursor, 42);
        assert!(obs.started_at.is_none());
    }
}
