// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Upload pipeline
//!
//! Runs a batch of candidates through a pool of `parallel_uploads` tasks.
//! Each item ends in exactly one checkpoint entry before the batch
//! returns. A successful upload is written to the dedup cache and the
//! checkpoint before it is reported, so a crash right after an upload never
//! causes a second one on restart. Every other outcome can be derived again
//! after a crash and is written once per batch.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use migration_types::{ActivityEvent, CatalogItem, CompletedEntry, CompletedStatus};

use crate::activity::ActivityLog;
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::dedup::DedupCache;
use crate::destination::{Destination, DestinationError, Progress, UploadOutcome};
use crate::metrics;
use crate::prepare::{PreparedItem, Preparer};
use crate::retry::{RetryPolicy, retry};

/// Tunables for the pipeline
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub parallel_uploads: usize,
    pub retry: RetryPolicy,
    /// No-progress window for a single attempt
    pub stuck_upload: Duration,
    /// Ceiling for a single attempt
    pub hard_timeout: Duration,
    pub dry_run: bool,
}

/// Counts for one batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub uploaded: usize,
    pub duplicate: usize,
    /// Hard failures and unprocessable items
    pub error: usize,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.uploaded + self.duplicate + self.error
    }

    fn add(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Uploaded => self.uploaded += 1,
            ItemOutcome::Duplicate => self.duplicate += 1,
            ItemOutcome::Error => self.error += 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ItemOutcome {
    Uploaded,
    Duplicate,
    Error,
}

/// An item's outcome plus the checkpoint entry still to be written
type Settled = (ItemOutcome, Option<(String, CompletedEntry)>);

struct PipelineContext {
    settings: PipelineSettings,
    checkpoint: Arc<CheckpointStore>,
    dedup: Arc<DedupCache>,
    destination: Arc<dyn Destination>,
    preparer: Preparer,
    activity: Arc<ActivityLog>,
    semaphore: Arc<Semaphore>,
}

pub struct UploadPipeline {
    ctx: Arc<PipelineContext>,
}

impl UploadPipeline {
    pub fn new(
        settings: PipelineSettings,
        checkpoint: Arc<CheckpointStore>,
        dedup: Arc<DedupCache>,
        destination: Arc<dyn Destination>,
        preparer: Preparer,
        activity: Arc<ActivityLog>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(settings.parallel_uploads.max(1)));
        Self {
            ctx: Arc::new(PipelineContext {
                settings,
                checkpoint,
                dedup,
                destination,
                preparer,
                activity,
                semaphore,
            }),
        }
    }

    /// Process a batch. Returns an error only if the checkpoint could not
    /// be written, in which case the caller must not advance the cursor.
    pub async fn run_batch(&self, items: Vec<CatalogItem>) -> Result<BatchResult, CheckpointError> {
        let mut tasks = JoinSet::new();
        for item in items {
            let ctx = Arc::clone(&self.ctx);
            tasks.spawn(async move {
                let _permit = ctx.semaphore.acquire().await;
                ctx.process(item).await
            });
        }

        let mut result = BatchResult::default();
        let mut deferred = Vec::new();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((outcome, entry))) => {
                    result.add(outcome);
                    deferred.extend(entry);
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Checkpoint write failed");
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Upload task join error");
                    failure.get_or_insert(CheckpointError::Join(e));
                }
            }
        }

        // Written even when an upload record failed; these are all settled.
        let flushed = self.ctx.checkpoint.record_many(deferred).await;
        match (failure, flushed) {
            (Some(e), _) | (None, Err(e)) => Err(e),
            (None, Ok(())) => Ok(result),
        }
    }
}

impl PipelineContext {
    async fn process(&self, item: CatalogItem) -> Result<Settled, CheckpointError> {
        let catalog_key = item.catalog_key();
        if self.checkpoint.is_completed(&catalog_key).await {
            return Ok((ItemOutcome::Duplicate, None));
        }

        let prepared = match self.preparer.prepare(&item).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(item_id = item.id, path = %item.path, error = %e, "Item preparation failed");
                self.activity
                    .emit(ActivityEvent::Error {
                        class: e.class(),
                        message: e.to_string(),
                    })
                    .await;
                let entry = self
                    .terminal(catalog_key, &item, e.status(), e.to_string())
                    .await;
                return Ok((ItemOutcome::Error, Some(entry)));
            }
        };

        let hash = prepared.hash().to_string();
        let size = prepared.size();

        if let Some(existing) = self.checkpoint.entry(&hash).await {
            // Same content already settled, possibly under another path.
            let entry = (existing.path != item.path).then(|| {
                (
                    catalog_key,
                    CompletedEntry::new(&item.path, CompletedStatus::AlreadyExists),
                )
            });
            tracing::debug!(item_id = item.id, hash = %hash, "Content already in checkpoint");
            metrics::record_duplicate(1);
            return Ok((ItemOutcome::Duplicate, entry));
        }

        if self.dedup.contains(&hash, size).await {
            self.activity
                .emit(ActivityEvent::DuplicateSkipped {
                    path: item.path.clone(),
                })
                .await;
            metrics::record_duplicate(1);
            let entry = CompletedEntry::new(&item.path, CompletedStatus::AlreadyExists);
            return Ok((ItemOutcome::Duplicate, Some((hash, entry))));
        }

        if !prepared.has_title() {
            let entry = self
                .terminal(
                    hash,
                    &item,
                    CompletedStatus::InsufficientMetadata,
                    "no title in metadata or file name".to_string(),
                )
                .await;
            return Ok((ItemOutcome::Error, Some(entry)));
        }

        if self.settings.dry_run {
            tracing::info!(item_id = item.id, path = %item.path, size, "Dry run: would upload");
            let entry = CompletedEntry::new(&item.path, CompletedStatus::Uploaded);
            return Ok((ItemOutcome::Uploaded, Some((hash, entry))));
        }

        let result = retry(&self.settings.retry, "destination.upload", || {
            self.upload_once(&prepared)
        })
        .await;

        match result {
            Ok(UploadOutcome::Uploaded) => {
                self.dedup.insert(&hash, size).await;
                self.checkpoint
                    .record(
                        hash.clone(),
                        CompletedEntry::new(&item.path, CompletedStatus::Uploaded),
                    )
                    .await?;
                metrics::record_uploaded(size);
                tracing::debug!(item_id = item.id, hash = %hash, size, "Uploaded");
                self.activity
                    .emit(ActivityEvent::UploadSucceeded {
                        path: item.path.clone(),
                        hash,
                        bytes: size,
                    })
                    .await;
                Ok((ItemOutcome::Uploaded, None))
            }
            Ok(UploadOutcome::AlreadyExists) => {
                self.dedup.insert(&hash, size).await;
                metrics::record_duplicate(1);
                self.activity
                    .emit(ActivityEvent::DuplicateSkipped {
                        path: item.path.clone(),
                    })
                    .await;
                let entry = CompletedEntry::new(&item.path, CompletedStatus::AlreadyExists);
                Ok((ItemOutcome::Duplicate, Some((hash, entry))))
            }
            Err(e) => {
                tracing::warn!(
                    item_id = item.id,
                    path = %item.path,
                    error = %e,
                    "Upload failed"
                );
                self.activity
                    .emit(ActivityEvent::Error {
                        class: e.class(),
                        message: e.to_string(),
                    })
                    .await;
                let entry = self
                    .terminal(hash, &item, CompletedStatus::Skipped, e.to_string())
                    .await;
                Ok((ItemOutcome::Error, Some(entry)))
            }
        }
    }

    /// Entry for an unprocessable or failed item, so the cursor can move
    /// past it.
    async fn terminal(
        &self,
        key: String,
        item: &CatalogItem,
        status: CompletedStatus,
        reason: String,
    ) -> (String, CompletedEntry) {
        let entry = CompletedEntry::new(&item.path, status).with_reason(reason.clone());
        if status == CompletedStatus::InsufficientMetadata {
            metrics::record_skipped();
        } else {
            metrics::record_error();
        }
        self.activity
            .emit(ActivityEvent::ItemSkipped {
                path: item.path.clone(),
                status,
                reason,
            })
            .await;
        (key, entry)
    }

    async fn upload_once(&self, prepared: &PreparedItem) -> Result<UploadOutcome, DestinationError> {
        let progress = Progress::default();
        let upload = self.destination.upload(&prepared.request, &progress);
        watchdog(
            upload,
            &progress,
            self.settings.stuck_upload,
            self.settings.hard_timeout,
        )
        .await
    }
}

/// Abort `fut` if `progress` stops moving for `stall`, or if it runs
/// longer than `hard`.
///
/// The stall window also covers the wait for a response once every byte
/// has been sent.
pub async fn watchdog<F, T>(
    fut: F,
    progress: &Progress,
    stall: Duration,
    hard: Duration,
) -> Result<T, DestinationError>
where
    F: Future<Output = Result<T, DestinationError>>,
{
    let started = Instant::now();
    let mut last = progress.get();
    let mut last_change = Instant::now();
    let period = (stall / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    let mut tick = tokio::time::interval(period);

    tokio::pin!(fut);
    loop {
        tokio::select! {
            res = &mut fut => return res,
            _ = tick.tick() => {
                if started.elapsed() >= hard {
                    return Err(DestinationError::Timeout(format!(
                        "upload exceeded {}s ceiling",
                        hard.as_secs()
                    )));
                }
                let now = progress.get();
                if now != last {
                    last = now;
                    last_change = Instant::now();
                } else if last_change.elapsed() >= stall {
                    return Err(DestinationError::Stalled(stall));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::destination::mock::MockDestination;
    use crate::destination::HashEntry;
    use crate::retry::Retryable;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        checkpoint: Arc<CheckpointStore>,
        dest: Arc<MockDestination>,
        pipeline: UploadPipeline,
    }

    fn book(dir: &TempDir, id: i64, name: &str, body: &str) -> CatalogItem {
        std::fs::write(dir.path().join(name), body).unwrap();
        CatalogItem {
            id,
            path: name.to_string(),
            format: "epub".to_string(),
            size: body.len() as u64,
        }
    }

    fn fixture(dry_run: bool) -> Fixture {
        let dir = tempdir().unwrap();
        let config = WorkerConfig {
            library_root: dir.path().to_path_buf(),
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let checkpoint =
            Arc::new(CheckpointStore::open(&dir.path().join("cp.json"), !dry_run).unwrap());
        let dest = Arc::new(MockDestination::default());
        let dedup = DedupCache::new(dest.clone());
        let settings = PipelineSettings {
            parallel_uploads: 3,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            stuck_upload: Duration::from_secs(5),
            hard_timeout: Duration::from_secs(30),
            dry_run,
        };
        let pipeline = UploadPipeline::new(
            settings,
            checkpoint.clone(),
            dedup,
            dest.clone(),
            Preparer::new(&config),
            Arc::new(ActivityLog::disabled()),
        );
        Fixture {
            dir,
            checkpoint,
            dest,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_uploads_and_records() {
        let f = fixture(false);
        let items = vec![
            book(&f.dir, 1, "A - One.epub", "one"),
            book(&f.dir, 2, "B - Two.epub", "two"),
        ];
        let result = f.pipeline.run_batch(items).await.unwrap();
        assert_eq!(
            result,
            BatchResult {
                uploaded: 2,
                duplicate: 0,
                error: 0
            }
        );
        let cp = f.checkpoint.snapshot().await;
        assert_eq!(cp.completed.len(), 2);
        assert!(
            cp.completed
                .values()
                .all(|e| e.status == CompletedStatus::Uploaded)
        );
    }

    #[tokio::test]
    async fn test_second_run_does_not_reupload() {
        let f = fixture(false);
        let items = vec![book(&f.dir, 1, "A - One.epub", "one")];
        f.pipeline.run_batch(items.clone()).await.unwrap();
        let again = f.pipeline.run_batch(items).await.unwrap();
        assert_eq!(again.uploaded, 0);
        assert_eq!(again.duplicate, 1);
        assert_eq!(f.dest.uploaded.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_dedup_cache_hit_skips_upload() {
        let f = fixture(false);
        let item = book(&f.dir, 1, "A - One.epub", "one");
        let (hash, size) = crate::prepare::hash_file(&f.dir.path().join("A - One.epub"))
            .await
            .unwrap();
        f.dest.hashes.lock().await.push(HashEntry {
            hash: hash.clone(),
            size,
            created_at: chrono::Utc::now(),
        });

        let result = f.pipeline.run_batch(vec![item]).await.unwrap();
        assert_eq!(result.duplicate, 1);
        assert!(f.dest.uploaded.lock().await.is_empty());
        assert_eq!(
            f.checkpoint.entry(&hash).await.unwrap().status,
            CompletedStatus::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_settled_duplicates_are_written_once_per_batch() {
        let f = fixture(false);
        let mut items = Vec::new();
        for id in 1..=5 {
            let name = format!("A - Book {id}.epub");
            let body = format!("body {id}");
            items.push(book(&f.dir, id, &name, &body));
            let (hash, size) = crate::prepare::hash_file(&f.dir.path().join(&name))
                .await
                .unwrap();
            f.dest.hashes.lock().await.push(HashEntry {
                hash,
                size,
                created_at: chrono::Utc::now(),
            });
        }
        items.push(book(&f.dir, 6, "B - New.epub", "new"));

        let result = f.pipeline.run_batch(items).await.unwrap();
        assert_eq!(result.duplicate, 5);
        assert_eq!(result.uploaded, 1);
        // One write for the upload, one for everything else.
        assert_eq!(f.checkpoint.writes(), 2);
        assert_eq!(f.checkpoint.snapshot().await.completed.len(), 6);

        let on_disk = crate::checkpoint::load(&f.dir.path().join("cp.json")).unwrap();
        assert_eq!(on_disk.completed.len(), 6);
    }

    #[tokio::test]
    async fn test_retryable_failure_then_success() {
        let f = fixture(false);
        let item = book(&f.dir, 1, "A - One.epub", "one");
        let (hash, _) = crate::prepare::hash_file(&f.dir.path().join("A - One.epub"))
            .await
            .unwrap();
        f.dest.failures.lock().await.insert(
            hash,
            vec![
                DestinationError::Connect("refused".to_string()),
                DestinationError::Server {
                    status: 503,
                    body: String::new(),
                },
            ],
        );

        let result = f.pipeline.run_batch(vec![item]).await.unwrap();
        assert_eq!(result.uploaded, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_recorded_skipped() {
        let f = fixture(false);
        let item = book(&f.dir, 1, "A - One.epub", "one");
        let (hash, _) = crate::prepare::hash_file(&f.dir.path().join("A - One.epub"))
            .await
            .unwrap();
        f.dest.failures.lock().await.insert(
            hash.clone(),
            vec![DestinationError::Validation {
                status: 422,
                body: "bad".to_string(),
            }],
        );

        let result = f.pipeline.run_batch(vec![item]).await.unwrap();
        assert_eq!(result.error, 1);
        let entry = f.checkpoint.entry(&hash).await.unwrap();
        assert_eq!(entry.status, CompletedStatus::Skipped);
        assert!(entry.reason.unwrap().contains("422"));
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped_under_catalog_key() {
        let f = fixture(false);
        let item = CatalogItem {
            id: 77,
            path: "gone.epub".to_string(),
            format: "epub".to_string(),
            size: 1,
        };
        let result = f.pipeline.run_batch(vec![item]).await.unwrap();
        assert_eq!(result.error, 1);
        let entry = f.checkpoint.entry("catalog:77").await.unwrap();
        assert_eq!(entry.status, CompletedStatus::Skipped);
    }

    #[tokio::test]
    async fn test_dry_run_uploads_nothing() {
        let f = fixture(true);
        let items = vec![book(&f.dir, 1, "A - One.epub", "one")];
        let result = f.pipeline.run_batch(items).await.unwrap();
        assert_eq!(result.uploaded, 1);
        assert!(f.dest.uploaded.lock().await.is_empty());
        assert!(!f.dir.path().join("cp.json").exists());
    }

    #[tokio::test]
    async fn test_watchdog_aborts_stalled_upload() {
        let progress = Progress::default();
        let stalled = std::future::pending::<Result<(), DestinationError>>();
        let err = watchdog(
            stalled,
            &progress,
            Duration::from_millis(50),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DestinationError::Stalled(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_watchdog_hard_ceiling_despite_progress() {
        let progress = Progress::default();
        let ticking = progress.clone();
        let busy = async move {
            while ticking.get() < u64::MAX {
                ticking.add(1);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok::<(), DestinationError>(())
        };
        let err = watchdog(
            busy,
            &progress,
            Duration::from_millis(50),
            Duration::from_millis(120),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DestinationError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_watchdog_stalls_on_silent_response() {
        let progress = Progress::default();
        let sender = progress.clone();
        let body_then_silence = async move {
            sender.add(100);
            std::future::pending::<()>().await;
            Ok::<(), DestinationError>(())
        };
        let started = Instant::now();
        let err = watchdog(
            body_then_silence,
            &progress,
            Duration::from_millis(50),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DestinationError::Stalled(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_watchdog_passes_result_through() {
        let progress = Progress::default();
        let done = async { Ok::<u32, DestinationError>(7) };
        let v = watchdog(
            done,
            &progress,
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(v, 7);
    }
}
