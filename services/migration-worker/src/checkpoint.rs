// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Crash-safe checkpoint store
//!
//! The checkpoint is only ever replaced whole: the new document is written
//! to a temp file next to the target, fsynced, and renamed over it while an
//! exclusive `flock` is held on a sibling `.lock` file. A crash at any point
//! leaves either the previous document or the new one on disk.
//!
//! All mutations go through one async mutex, so concurrent upload tasks
//! never interleave the write-then-rename sequence.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::Mutex;

use migration_types::{Checkpoint, CheckpointDecodeError, CompletedEntry};

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Corrupt checkpoint {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: CheckpointDecodeError,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Checkpoint writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CheckpointError {
    fn io(path: &Path, source: io::Error) -> Self {
        CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Read a checkpoint file without taking ownership of it.
///
/// A missing file is a fresh checkpoint.
pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Checkpoint::default()),
        Err(e) => return Err(CheckpointError::io(path, e)),
    };
    Checkpoint::decode(&text).map_err(|source| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Per-worker checkpoint with a single writer
pub struct CheckpointStore {
    path: PathBuf,
    persist: bool,
    state: Mutex<Checkpoint>,
    writes: AtomicU64,
}

impl CheckpointStore {
    /// Open (or start) the checkpoint at `path`.
    ///
    /// With `persist == false` (dry run) the document lives in memory only.
    pub fn open(path: &Path, persist: bool) -> Result<Self, CheckpointError> {
        let checkpoint = load(path)?;
        tracing::info!(
            path = %path.display(),
            cursor = checkpoint.cursor,
            completed = checkpoint.completed.len(),
            "Loaded checkpoint"
        );

        Ok(Self {
            path: path.to_path_buf(),
            persist,
            state: Mutex::new(checkpoint),
            writes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Documents written since open
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> Checkpoint {
        self.state.lock().await.clone()
    }

    pub async fn cursor(&self) -> i64 {
        self.state.lock().await.cursor
    }

    pub async fn is_completed(&self, key: &str) -> bool {
        self.state.lock().await.is_completed(key)
    }

    pub async fn entry(&self, key: &str) -> Option<CompletedEntry> {
        self.state.lock().await.completed.get(key).cloned()
    }

    /// Record the terminal outcome of one item and persist.
    pub async fn record(&self, key: String, entry: CompletedEntry) -> Result<(), CheckpointError> {
        self.record_many(vec![(key, entry)]).await
    }

    /// Record several outcomes with a single write.
    pub async fn record_many(
        &self,
        entries: Vec<(String, CompletedEntry)>,
    ) -> Result<(), CheckpointError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.completed.extend(entries);
        self.persist_locked(&next).await?;
        *state = next;
        Ok(())
    }

    /// Move the cursor forward and persist. Returns false (and writes
    /// nothing) if `cursor` is behind the current one.
    pub async fn advance(&self, cursor: i64) -> Result<bool, CheckpointError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        if !next.advance_to(cursor) {
            tracing::warn!(
                current = state.cursor,
                requested = cursor,
                "Refusing to move checkpoint cursor backwards"
            );
            return Ok(false);
        }
        if next.cursor == state.cursor {
            return Ok(true);
        }
        self.persist_locked(&next).await?;
        *state = next;
        Ok(true)
    }

    /// Must be called with the state lock held.
    async fn persist_locked(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if !self.persist {
            return Ok(());
        }
        let bytes = checkpoint.encode()?.into_bytes();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes)).await??;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Exclusive advisory lock, released on drop.
struct FileLock {
    _file: File,
}

impl FileLock {
    fn exclusive(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is owned by `file`, which outlives the lock.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { _file: file })
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Write `bytes` to the temp file next to `path` and fsync it.
pub fn stage(path: &Path, bytes: &[u8]) -> Result<PathBuf, CheckpointError> {
    let tmp = sibling(path, ".tmp");
    let mut file = File::create(&tmp).map_err(|e| CheckpointError::io(&tmp, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| CheckpointError::io(&tmp, e))?;
    Ok(tmp)
}

/// Rename the staged temp file over `path` and fsync the directory.
pub fn commit(tmp: &Path, path: &Path) -> Result<(), CheckpointError> {
    std::fs::rename(tmp, path).map_err(|e| CheckpointError::io(path, e))?;
    if let Some(dir) = path.parent() {
        // Directory fsync is best effort; the rename itself already happened.
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let lock_path = sibling(path, ".lock");
    let _lock = FileLock::exclusive(&lock_path).map_err(|e| CheckpointError::io(&lock_path, e))?;
    let tmp = stage(path, bytes)?;
    commit(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration_types::CompletedStatus;
    use tempfile::tempdir;

    fn entry(path: &str, status: CompletedStatus) -> CompletedEntry {
        CompletedEntry::new(path, status)
    }

    #[tokio::test]
    async fn test_missing_file_is_fresh() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(&dir.path().join("cp.json"), true).unwrap();
        assert_eq!(store.cursor().await, 0);
        assert!(store.snapshot().await.completed.is_empty());
    }

    #[tokio::test]
    async fn test_record_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.json");

        let store = CheckpointStore::open(&path, true).unwrap();
        store
            .record("h1".to_string(), entry("a.epub", CompletedStatus::Uploaded))
            .await
            .unwrap();
        assert!(store.advance(50).await.unwrap());

        let reopened = CheckpointStore::open(&path, true).unwrap();
        assert_eq!(reopened.cursor().await, 50);
        assert!(reopened.is_completed("h1").await);
        assert!(!path.with_file_name("cp.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_advance_refuses_to_go_back() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(&dir.path().join("cp.json"), true).unwrap();
        assert!(store.advance(100).await.unwrap());
        assert!(!store.advance(10).await.unwrap());
        assert_eq!(store.cursor().await, 100);
    }

    #[tokio::test]
    async fn test_crash_between_stage_and_commit_keeps_previous() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.json");

        let store = CheckpointStore::open(&path, true).unwrap();
        store
            .record("h1".to_string(), entry("a.epub", CompletedStatus::Uploaded))
            .await
            .unwrap();
        store.advance(10).await.unwrap();

        // New content reaches the temp file but the rename never happens.
        let mut next = store.snapshot().await;
        next.cursor = 999;
        stage(&path, next.encode().unwrap().as_bytes()).unwrap();

        let recovered = load(&path).unwrap();
        assert_eq!(recovered.cursor, 10);
        assert!(recovered.is_completed("h1"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.json");
        let store = CheckpointStore::open(&path, false).unwrap();
        store.advance(5).await.unwrap();
        store
            .record("x".to_string(), entry("x.pdf", CompletedStatus::Skipped))
            .await
            .unwrap();
        assert_eq!(store.cursor().await, 5);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_concurrent_records_are_all_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.json");
        let store = std::sync::Arc::new(CheckpointStore::open(&path, true).unwrap());

        let mut set = tokio::task::JoinSet::new();
        for i in 0..16 {
            let store = std::sync::Arc::clone(&store);
            set.spawn(async move {
                store
                    .record(format!("h{}", i), entry("f", CompletedStatus::Uploaded))
                    .await
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }

        assert_eq!(load(&path).unwrap().completed.len(), 16);
    }

    #[test]
    fn test_load_concatenated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(
            &path,
            r#"{"cursor":1,"completed":{}}{"cursor":7,"completed":{}}"#,
        )
        .unwrap();
        assert_eq!(load(&path).unwrap().cursor, 7);
    }

    #[test]
    fn test_load_corrupt_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, "{\"cursor\":").unwrap();
        assert!(matches!(load(&path), Err(CheckpointError::Corrupt { .. })));
    }
}
