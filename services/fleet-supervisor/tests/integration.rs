// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Supervisor tests against real worker processes
//!
//! The "worker" is a shell script that speaks the activity-log format, so
//! these tests exercise process spawning, observation, remediation and the
//! autoscaler together.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use tempfile::{TempDir, tempdir};

use fleet_supervisor::diskio::NoDiskIo;
use fleet_supervisor::health::WorkerState;
use fleet_supervisor::history::FixHistory;
use fleet_supervisor::process::{LauncherSettings, ProcessLauncher, WorkerLauncher};
use fleet_supervisor::remediation::RemediationState;
use fleet_supervisor::{FleetStatus, Supervisor, SupervisorConfig};
use migration_types::{FixType, WorkerFiles};

/// Writes a checkpoint and a short run that finds five rows and completes.
const COMPLETING_WORKER: &str = r#"
id=$3
d="$MIGRATION_STATE_DIR"
ts=$(date -u +%Y-%m-%dT%H:%M:%SZ)
printf '{"cursor":5,"completed":{}}' > "$d/worker-$id.checkpoint.json"
printf '{"ts":"%s","event":"worker_started","worker_id":%s,"cursor":0}\n' "$ts" "$id" >> "$d/worker-$id.activity.log"
printf '{"ts":"%s","event":"query_executed","cursor":0,"rows":5}\n' "$ts" >> "$d/worker-$id.activity.log"
printf '{"ts":"%s","event":"completed","cursor":5,"uploaded_total":5}\n' "$ts" >> "$d/worker-$id.activity.log"
"#;

/// Announces itself, then hangs.
const HANGING_WORKER: &str = r#"
id=$3
d="$MIGRATION_STATE_DIR"
ts=$(date -u +%Y-%m-%dT%H:%M:%SZ)
printf '{"cursor":0,"completed":{}}' > "$d/worker-$id.checkpoint.json"
printf '{"ts":"%s","event":"worker_started","worker_id":%s,"cursor":0}\n' "$ts" "$id" >> "$d/worker-$id.activity.log"
exec sleep 60
"#;

struct TestContext {
    dir: TempDir,
    launcher: Arc<ProcessLauncher>,
    supervisor: Supervisor,
}

impl TestContext {
    fn new(script: &str) -> Self {
        let dir = tempdir().unwrap();
        let config = SupervisorConfig {
            state_dir: dir.path().to_path_buf(),
            initial_workers: 1,
            min_workers: 1,
            max_workers: 1,
            ..Default::default()
        };
        let launcher = Arc::new(ProcessLauncher::new(LauncherSettings {
            binary: "/bin/sh".into(),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
            state_dir: dir.path().to_path_buf(),
            slice_size: 0,
            grace: Duration::from_secs(2),
        }));
        let supervisor = Supervisor::new(config, launcher.clone(), Arc::new(NoDiskIo))
            .expect("open supervisor");
        Self {
            dir,
            launcher,
            supervisor,
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    async fn wait_for<F: Fn() -> bool>(&self, what: &str, f: F) {
        for _ in 0..100 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }
}

#[tokio::test]
async fn test_completed_worker_is_not_restarted() {
    let mut ctx = TestContext::new(COMPLETING_WORKER);

    let status = ctx.supervisor.cycle(Utc::now()).await;
    assert_eq!(status.desired_workers, 1);

    let log = WorkerFiles::new(ctx.path(), 0).activity_log();
    ctx.wait_for("completion", || {
        std::fs::read_to_string(&log).is_ok_and(|t| t.contains("\"completed\""))
    })
    .await;
    for _ in 0..100 {
        if ctx.launcher.running().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let status = ctx.supervisor.cycle(Utc::now()).await;
    assert!(status.running_workers.is_empty());
    assert_eq!(status.workers.len(), 1);
    assert_eq!(status.workers[0].state, WorkerState::Completed);
    assert_eq!(status.workers[0].cursor, 5);

    let on_disk = FleetStatus::load(ctx.path()).unwrap();
    assert_eq!(on_disk.workers[0].state, WorkerState::Completed);
}

#[tokio::test]
async fn test_hanging_worker_is_restarted() {
    let mut ctx = TestContext::new(HANGING_WORKER);

    ctx.supervisor.cycle(Utc::now()).await;
    let log = WorkerFiles::new(ctx.path(), 0).activity_log();
    ctx.wait_for("worker start", || {
        std::fs::read_to_string(&log).is_ok_and(|t| t.contains("worker_started"))
    })
    .await;

    // Two hours later, still nothing past discovery.
    let status = ctx
        .supervisor
        .cycle(Utc::now() + ChronoDuration::hours(2))
        .await;
    assert_eq!(status.workers[0].state, WorkerState::Stuck);
    assert_eq!(status.workers[0].remediation, RemediationState::FixApplied);
    assert_eq!(status.running_workers, vec![0]);

    let history = FixHistory::open(ctx.path(), 500).unwrap();
    assert_eq!(history.records().len(), 1);
    assert_eq!(history.records()[0].fix_type, FixType::Restart);
    assert!(history.records()[0].success);

    assert!(ctx.launcher.terminate(0).await.unwrap());
}

#[tokio::test]
async fn test_reset_marker_round_trip() {
    let mut ctx = TestContext::new(HANGING_WORKER);
    let marker = WorkerFiles::new(ctx.path(), 0).reset_marker();
    std::fs::write(&marker, "").unwrap();

    ctx.supervisor.cycle(Utc::now()).await;
    assert!(!marker.exists());

    assert!(ctx.launcher.terminate(0).await.unwrap());
}
