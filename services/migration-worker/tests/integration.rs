// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

// Allow expect/unwrap in tests - they provide clear panic messages on failure
#![allow(clippy::expect_used, clippy::unwrap_used)]

//! End-to-end tests for the migration worker.
//!
//! Each test builds a SQLite catalog and a library tree in a temp
//! directory, stands up a mock destination with wiremock and runs a real
//! [`Worker`] against both.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rusqlite::{Connection, params};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use migration_types::{ActivityEvent, ActivityRecord, Checkpoint, CompletedStatus};
use migration_worker::catalog::SqliteCatalog;
use migration_worker::checkpoint;
use migration_worker::destination::HttpDestination;
use migration_worker::retry::RetryPolicy;
use migration_worker::{Worker, WorkerConfig, WorkerOutcome};

// ============================================================================
// Test Infrastructure
// ============================================================================

/// Sizes at or above this are unknown to the destination.
const NEW_SIZE_FLOOR: u64 = 1_000_000;

/// Answers the size-only existence check from the size alone.
struct SizeOracle;

impl Respond for SizeOracle {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).expect("existence body is JSON");
        let results: Vec<Value> = body["items"]
            .as_array()
            .expect("items array")
            .iter()
            .map(|q| json!({ "exists": q["size"].as_u64().unwrap_or(0) < NEW_SIZE_FLOOR }))
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "results": results }))
    }
}

struct TestContext {
    dir: TempDir,
    server: MockServer,
}

impl TestContext {
    async fn new() -> Self {
        // The binary installs this in main(); tests build clients directly.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let dir = TempDir::new().expect("failed to create temp dir");
        std::fs::create_dir_all(dir.path().join("library")).unwrap();
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        Connection::open(dir.path().join("metadata.db"))
            .unwrap()
            .execute_batch(
                "CREATE TABLE catalog (id INTEGER PRIMARY KEY, path TEXT, format TEXT, size INTEGER);",
            )
            .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/files/hashes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "entries": [] })))
            .mount(&server)
            .await;

        Self { dir, server }
    }

    async fn mount_size_oracle(&self) {
        Mock::given(method("POST"))
            .and(path("/api/v1/files/exists"))
            .respond_with(SizeOracle)
            .mount(&self.server)
            .await;
    }

    /// Catalog rows `1..=existing` are known to the destination by size;
    /// the next `new` rows are not and have a file on disk.
    fn populate(&self, existing: i64, new: i64) {
        let conn = Connection::open(self.dir.path().join("metadata.db")).unwrap();
        for id in 1..=existing {
            conn.execute(
                "INSERT INTO catalog (id, path, format, size) VALUES (?1, ?2, 'EPUB', ?3)",
                params![id, format!("old/Author - Old {}.epub", id), 1000 + id],
            )
            .unwrap();
        }
        for id in existing + 1..=existing + new {
            let rel = format!("new/Author - New {}.epub", id);
            let full = self.dir.path().join("library").join(&rel);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(&full, format!("content of book {}", id)).unwrap();
            conn.execute(
                "INSERT INTO catalog (id, path, format, size) VALUES (?1, ?2, 'EPUB', ?3)",
                params![id, rel, NEW_SIZE_FLOOR as i64 + id],
            )
            .unwrap();
        }
    }

    fn config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: 0,
            state_dir: self.dir.path().join("state"),
            catalog_path: self.dir.path().join("metadata.db"),
            library_root: self.dir.path().join("library"),
            destination_url: self.server.uri(),
            retry_base_delay: Duration::from_millis(10),
            skip_ahead_stride: 0,
            ..Default::default()
        }
    }

    async fn worker(&self, config: WorkerConfig) -> Worker {
        let catalog = SqliteCatalog::open(&config.catalog_path, None, config.db_busy_timeout)
            .expect("failed to open catalog");
        let destination =
            HttpDestination::new(&config.destination_url, None, Duration::from_secs(5))
                .expect("failed to build destination");
        Worker::new(config, Arc::new(catalog), Arc::new(destination))
            .await
            .expect("failed to build worker")
            .with_walker_policies(RetryPolicy::none(), RetryPolicy::none())
    }

    fn checkpoint(&self) -> Checkpoint {
        checkpoint::load(&self.config().files().checkpoint()).unwrap()
    }

    fn activity(&self) -> Vec<ActivityRecord> {
        let text = std::fs::read_to_string(self.config().files().activity_log()).unwrap();
        ActivityRecord::decode_all(&text)
    }
}

async fn run(worker: &Worker) -> WorkerOutcome {
    let (_tx, rx) = watch::channel(false);
    worker.run(rx).await.expect("worker run failed")
}

fn count_status(cp: &Checkpoint, status: CompletedStatus) -> usize {
    cp.completed.values().filter(|e| e.status == status).count()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_mixed_batch_uploads_only_new_items() {
    let ctx = TestContext::new().await;
    ctx.populate(80, 20);
    ctx.mount_size_oracle().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/files"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "status": "created" })))
        .expect(20)
        .mount(&ctx.server)
        .await;

    let worker = ctx.worker(ctx.config()).await;
    let outcome = run(&worker).await;

    assert_eq!(
        outcome,
        WorkerOutcome::Completed {
            cursor: 100,
            uploaded: 20
        }
    );

    let cp = ctx.checkpoint();
    assert_eq!(cp.cursor, 100);
    assert_eq!(cp.completed.len(), 100);
    assert_eq!(count_status(&cp, CompletedStatus::Uploaded), 20);
    assert_eq!(count_status(&cp, CompletedStatus::AlreadyExists), 80);
    assert!(cp.is_completed("catalog:1"));
    assert!(cp.is_completed("catalog:80"));
    assert!(!cp.is_completed("catalog:81"));

    let batches: Vec<_> = ctx
        .activity()
        .into_iter()
        .filter_map(|r| match r.event {
            ActivityEvent::BatchCompleted {
                uploaded,
                duplicate,
                error,
                ..
            } => Some((uploaded, duplicate, error)),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![(20, 80, 0)]);
}

#[tokio::test]
async fn test_restart_after_lost_cursor_uploads_nothing() {
    let ctx = TestContext::new().await;
    ctx.populate(5, 10);
    ctx.mount_size_oracle().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/files"))
        .respond_with(ResponseTemplate::new(201))
        .expect(10)
        .mount(&ctx.server)
        .await;

    {
        let worker = ctx.worker(ctx.config()).await;
        run(&worker).await;
    }

    // Crash after recording the uploads but before the cursor was saved.
    let path = ctx.config().files().checkpoint();
    let mut cp = ctx.checkpoint();
    cp.cursor = 0;
    std::fs::write(&path, cp.encode().unwrap()).unwrap();

    let worker = ctx.worker(ctx.config()).await;
    let outcome = run(&worker).await;
    assert_eq!(
        outcome,
        WorkerOutcome::Completed {
            cursor: 15,
            uploaded: 0
        }
    );
    assert_eq!(count_status(&ctx.checkpoint(), CompletedStatus::Uploaded), 10);
}

#[tokio::test]
async fn test_completed_checkpoint_is_a_no_op() {
    let ctx = TestContext::new().await;
    ctx.populate(3, 2);
    ctx.mount_size_oracle().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/files"))
        .respond_with(ResponseTemplate::new(201))
        .expect(2)
        .mount(&ctx.server)
        .await;

    for _ in 0..3 {
        let worker = ctx.worker(ctx.config()).await;
        run(&worker).await;
    }
    assert_eq!(ctx.checkpoint().completed.len(), 5);
}

#[tokio::test]
async fn test_transient_server_error_is_retried() {
    let ctx = TestContext::new().await;
    ctx.populate(0, 1);
    ctx.mount_size_oracle().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/files"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&ctx.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/files"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .with_priority(2)
        .mount(&ctx.server)
        .await;

    let worker = ctx.worker(ctx.config()).await;
    let outcome = run(&worker).await;
    assert!(matches!(outcome, WorkerOutcome::Completed { uploaded: 1, .. }));
    assert_eq!(count_status(&ctx.checkpoint(), CompletedStatus::Uploaded), 1);
}

#[tokio::test]
async fn test_validation_error_is_recorded_not_retried() {
    let ctx = TestContext::new().await;
    ctx.populate(0, 2);
    ctx.mount_size_oracle().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/files"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad title"))
        .expect(2)
        .mount(&ctx.server)
        .await;

    let worker = ctx.worker(ctx.config()).await;
    let outcome = run(&worker).await;
    assert!(matches!(outcome, WorkerOutcome::Completed { cursor: 2, uploaded: 0 }));

    let cp = ctx.checkpoint();
    assert_eq!(count_status(&cp, CompletedStatus::Skipped), 2);
    let entry = cp.completed.values().next().unwrap();
    assert!(entry.reason.as_deref().unwrap().contains("422"));
}

#[tokio::test]
async fn test_failed_existence_check_falls_back_to_upload_answer() {
    let ctx = TestContext::new().await;
    ctx.populate(0, 3);
    Mock::given(method("POST"))
        .and(path("/api/v1/files/exists"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&ctx.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/files"))
        .respond_with(ResponseTemplate::new(409))
        .expect(3)
        .mount(&ctx.server)
        .await;

    let worker = ctx.worker(ctx.config()).await;
    let outcome = run(&worker).await;
    assert!(matches!(outcome, WorkerOutcome::Completed { cursor: 3, uploaded: 0 }));
    assert_eq!(
        count_status(&ctx.checkpoint(), CompletedStatus::AlreadyExists),
        3
    );
}

#[tokio::test]
async fn test_missing_file_is_skipped_and_cursor_moves() {
    let ctx = TestContext::new().await;
    ctx.populate(0, 2);
    std::fs::remove_file(ctx.dir.path().join("library/new/Author - New 1.epub")).unwrap();
    ctx.mount_size_oracle().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/files"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&ctx.server)
        .await;

    let worker = ctx.worker(ctx.config()).await;
    run(&worker).await;

    let cp = ctx.checkpoint();
    assert_eq!(cp.cursor, 2);
    assert_eq!(
        cp.completed.get("catalog:1").map(|e| e.status),
        Some(CompletedStatus::Skipped)
    );
}

#[tokio::test]
async fn test_slices_partition_the_catalog() {
    let ctx = TestContext::new().await;
    ctx.populate(0, 10);
    ctx.mount_size_oracle().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/files"))
        .respond_with(ResponseTemplate::new(201))
        .expect(10)
        .mount(&ctx.server)
        .await;

    let first = ctx
        .worker(WorkerConfig {
            worker_id: 1,
            end_cursor: Some(4),
            ..ctx.config()
        })
        .await;
    let second = ctx
        .worker(WorkerConfig {
            worker_id: 2,
            start_cursor: 4,
            ..ctx.config()
        })
        .await;
    let (a, b) = tokio::join!(run(&first), run(&second));
    assert!(matches!(a, WorkerOutcome::Completed { cursor: 4, uploaded: 4 }));
    assert!(matches!(b, WorkerOutcome::Completed { cursor: 10, uploaded: 6 }));

    let state = ctx.dir.path().join("state");
    let checkpoints = migration_worker::reconcile::load_checkpoints(&state).unwrap();
    assert_eq!(checkpoints.len(), 2);

    let catalog = SqliteCatalog::open(
        &ctx.dir.path().join("metadata.db"),
        None,
        Duration::from_secs(1),
    )
    .unwrap();
    let report = migration_worker::reconcile::reconcile(Arc::new(catalog), &checkpoints, 3, 10)
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.total, 10);
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let ctx = TestContext::new().await;
    ctx.populate(2, 3);
    ctx.mount_size_oracle().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/files"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&ctx.server)
        .await;

    let worker = ctx
        .worker(WorkerConfig {
            dry_run: true,
            ..ctx.config()
        })
        .await;
    let outcome = run(&worker).await;
    assert!(matches!(outcome, WorkerOutcome::Completed { uploaded: 3, .. }));
    assert!(!ctx.config().files().checkpoint().exists());
}
