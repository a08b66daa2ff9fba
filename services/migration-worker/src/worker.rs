// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! The migration loop
//!
//! A [`Worker`] composes the checkpoint store, dedup cache, catalog walker
//! and upload pipeline into one long-running loop over its catalog slice:
//!
//! 1. fetch the page after the checkpoint cursor
//! 2. record size-only duplicates as already-exists
//! 3. run the remaining candidates through the pipeline
//! 4. advance the cursor to the highest id in the page
//!
//! The cursor moves even when a page was entirely duplicates. After a run
//! of full pages with no new uploads the worker skips ahead by a fixed
//! stride; the reconciliation pass covers anything that skip may miss.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::watch;

use migration_types::{ActivityEvent, CompletedEntry, CompletedStatus, Phase};

use crate::activity::ActivityLog;
use crate::catalog::{CatalogError, CatalogSource, CatalogWalker};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::WorkerConfig;
use crate::dedup::DedupCache;
use crate::destination::Destination;
use crate::metrics;
use crate::pipeline::{BatchResult, PipelineSettings, UploadPipeline};
use crate::prepare::Preparer;
use crate::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The catalog (or this worker's slice) is exhausted
    Completed { cursor: i64, uploaded: u64 },
    /// Shutdown was requested or the runtime ceiling was reached
    Interrupted { cursor: i64, uploaded: u64 },
}

/// Counts consecutive full batches that produced no new uploads.
#[derive(Debug)]
pub struct DuplicateStreak {
    limit: u32,
    count: u32,
}

impl DuplicateStreak {
    pub fn new(limit: u32) -> Self {
        Self { limit, count: 0 }
    }

    /// Feed one batch. Returns true when the streak reaches the limit, and
    /// starts counting again.
    pub fn observe(&mut self, full: bool, result: &BatchResult) -> bool {
        if full && result.uploaded == 0 && result.error == 0 {
            self.count += 1;
        } else {
            self.count = 0;
        }
        if self.limit > 0 && self.count >= self.limit {
            self.count = 0;
            return true;
        }
        false
    }
}

pub struct Worker {
    config: WorkerConfig,
    checkpoint: Arc<CheckpointStore>,
    dedup: Arc<DedupCache>,
    walker: CatalogWalker,
    pipeline: UploadPipeline,
    activity: Arc<ActivityLog>,
}

impl Worker {
    /// Wire up a worker against the given catalog and destination.
    pub async fn new(
        config: WorkerConfig,
        catalog: Arc<dyn CatalogSource>,
        destination: Arc<dyn Destination>,
    ) -> Result<Self, MigrationError> {
        config.validate().map_err(MigrationError::Config)?;
        tokio::fs::create_dir_all(&config.state_dir).await?;

        let files = config.files();
        let checkpoint = Arc::new(CheckpointStore::open(&files.checkpoint(), !config.dry_run)?);
        let activity = Arc::new(ActivityLog::open(&files.activity_log()).await?);
        let dedup = DedupCache::new(Arc::clone(&destination));

        let walker = CatalogWalker::new(
            catalog,
            Arc::clone(&destination),
            config.batch_size,
            config.existence_batch,
            config.end_cursor,
        );

        let pipeline = UploadPipeline::new(
            PipelineSettings {
                parallel_uploads: config.parallel_uploads,
                retry: RetryPolicy::upload(config.max_retries, config.retry_base_delay),
                stuck_upload: config.stuck_upload,
                hard_timeout: config.upload_hard_timeout,
                dry_run: config.dry_run,
            },
            Arc::clone(&checkpoint),
            Arc::clone(&dedup),
            destination,
            Preparer::new(&config),
            Arc::clone(&activity),
        );

        Ok(Self {
            config,
            checkpoint,
            dedup,
            walker,
            pipeline,
            activity,
        })
    }

    /// Replace the walker's retry policies.
    pub fn with_walker_policies(mut self, read: RetryPolicy, check: RetryPolicy) -> Self {
        self.walker = self.walker.with_policies(read, check);
        self
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    pub fn dedup(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    /// Run until the slice is exhausted or `shutdown` flips to true.
    ///
    /// Shutdown is checked between batches; a batch in progress is allowed
    /// to settle so every item in it gets a checkpoint entry.
    pub async fn run(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerOutcome, MigrationError> {
        let worker_id = self.config.worker_id;
        let started = Instant::now();

        if self.checkpoint.cursor().await < self.config.start_cursor {
            self.checkpoint.advance(self.config.start_cursor).await?;
        }
        let mut cursor = self.checkpoint.cursor().await;

        tracing::info!(
            worker_id,
            cursor,
            end_cursor = ?self.config.end_cursor,
            dry_run = self.config.dry_run,
            "Worker starting"
        );
        self.activity
            .emit(ActivityEvent::WorkerStarted {
                worker_id,
                cursor,
                end_cursor: self.config.end_cursor,
            })
            .await;

        let mut phase = Phase::Discovering;
        self.activity
            .emit(ActivityEvent::PhaseChanged { phase })
            .await;

        let mut streak = DuplicateStreak::new(self.config.duplicate_streak);
        let mut uploaded_total = 0u64;

        loop {
            if *shutdown.borrow() {
                tracing::info!(worker_id, cursor, "Shutdown requested");
                return Ok(WorkerOutcome::Interrupted {
                    cursor,
                    uploaded: uploaded_total,
                });
            }
            if self
                .config
                .max_runtime
                .is_some_and(|max| started.elapsed() >= max)
            {
                tracing::info!(worker_id, cursor, "Runtime ceiling reached");
                return Ok(WorkerOutcome::Interrupted {
                    cursor,
                    uploaded: uploaded_total,
                });
            }

            let batch_started = Instant::now();
            let page = match self.walker.next_page(cursor).await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    self.activity
                        .emit(ActivityEvent::Error {
                            class: e.class(),
                            message: e.to_string(),
                        })
                        .await;
                    return Err(e.into());
                }
            };

            self.activity
                .emit(ActivityEvent::QueryExecuted {
                    cursor,
                    rows: page.rows,
                })
                .await;
            self.activity
                .emit(ActivityEvent::FilesFound {
                    candidates: page.candidates.len(),
                    duplicates: page.duplicates.len(),
                })
                .await;

            let next_phase = if page.candidates.is_empty() {
                Phase::ProcessingDuplicates
            } else {
                Phase::Uploading
            };
            if next_phase != phase {
                phase = next_phase;
                self.activity
                    .emit(ActivityEvent::PhaseChanged { phase })
                    .await;
            }

            let duplicates: Vec<(String, CompletedEntry)> = page
                .duplicates
                .iter()
                .map(|item| {
                    (
                        item.catalog_key(),
                        CompletedEntry::new(&item.path, CompletedStatus::AlreadyExists),
                    )
                })
                .collect();
            let size_only_duplicates = duplicates.len();
            self.checkpoint.record_many(duplicates).await?;
            metrics::record_duplicate(size_only_duplicates);

            let full = page.is_full(self.config.batch_size);
            let mut result = self.pipeline.run_batch(page.candidates).await?;
            result.duplicate += size_only_duplicates;
            uploaded_total += result.uploaded as u64;

            self.checkpoint.advance(page.next_cursor).await?;
            cursor = self.checkpoint.cursor().await;

            tracing::info!(
                worker_id,
                cursor,
                uploaded = result.uploaded,
                duplicate = result.duplicate,
                error = result.error,
                "Batch complete"
            );
            self.activity
                .emit(ActivityEvent::BatchCompleted {
                    uploaded: result.uploaded,
                    duplicate: result.duplicate,
                    error: result.error,
                    cursor,
                })
                .await;

            metrics::record_batch_duration(batch_started.elapsed().as_secs_f64());
            metrics::set_cursor(cursor);
            self.write_metrics();

            if self.dedup.maybe_refresh_in_background().await {
                tracing::debug!(worker_id, "Started background dedup refresh");
            }

            if streak.observe(full, &result) && self.config.skip_ahead_stride > 0 {
                let mut target = cursor.saturating_add(self.config.skip_ahead_stride);
                if let Some(end) = self.config.end_cursor {
                    target = target.min(end);
                }
                if target > cursor {
                    tracing::info!(
                        worker_id,
                        from = cursor,
                        to = target,
                        "Skipping ahead past duplicate region"
                    );
                    self.activity
                        .emit(ActivityEvent::SkippedAhead {
                            from: cursor,
                            to: target,
                        })
                        .await;
                    self.checkpoint.advance(target).await?;
                    cursor = target;
                }
            }
        }

        tracing::info!(
            worker_id,
            cursor,
            uploaded = uploaded_total,
            checkpoint_writes = self.checkpoint.writes(),
            "Worker completed"
        );
        self.activity
            .emit(ActivityEvent::Completed {
                cursor,
                uploaded_total,
            })
            .await;
        self.write_metrics();

        Ok(WorkerOutcome::Completed {
            cursor,
            uploaded: uploaded_total,
        })
    }

    fn write_metrics(&self) {
        if let Some(path) = &self.config.metrics_file {
            if let Err(e) = metrics::write_textfile(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics file");
            }
        }
    }
}

/// Watch channel that flips to true on SIGINT or SIGTERM.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
        tracing::info!("Termination signal received, finishing current batch");
        let _ = tx.send(true);
        tx.closed().await;
    });
    rx
}
