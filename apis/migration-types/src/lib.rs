// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared types for the migration worker and the fleet supervisor.
//!
//! The worker writes checkpoints and activity logs; the supervisor reads
//! them. Both sides go through the encoders and decoders in this crate so
//! that the on-disk formats have exactly one definition.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Catalog
// ============================================================================

/// One row of the source catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Monotonic identifier used as the walk cursor.
    pub id: i64,
    /// Path relative to the library root.
    pub path: String,
    /// Lowercase format / extension, e.g. "epub".
    pub format: String,
    /// Size in bytes as recorded by the catalog.
    pub size: u64,
}

impl CatalogItem {
    /// Checkpoint key used when the item was resolved without hashing.
    pub fn catalog_key(&self) -> String {
        catalog_key(self.id)
    }
}

/// Checkpoint key for an item identified only by its catalog id.
pub fn catalog_key(id: i64) -> String {
    format!("catalog:{}", id)
}

// ============================================================================
// Checkpoint
// ============================================================================

/// Terminal outcome of a catalog item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletedStatus {
    Uploaded,
    AlreadyExists,
    InsufficientMetadata,
    Skipped,
}

impl fmt::Display for CompletedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompletedStatus::Uploaded => "uploaded",
            CompletedStatus::AlreadyExists => "already-exists",
            CompletedStatus::InsufficientMetadata => "insufficient-metadata",
            CompletedStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedEntry {
    pub path: String,
    pub status: CompletedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CompletedEntry {
    pub fn new(path: impl Into<String>, status: CompletedStatus) -> Self {
        CompletedEntry {
            path: path.into(),
            status,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum CheckpointDecodeError {
    #[error("checkpoint contains no complete JSON object: {0}")]
    NoCompleteObject(#[source] serde_json::Error),
}

/// Durable per-worker progress.
///
/// Every catalog item with an identifier at or below `cursor` is accounted
/// for in `completed` (or was a size-only duplicate recorded under its
/// `catalog:<id>` key).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub cursor: i64,
    #[serde(default)]
    pub completed: BTreeMap<String, CompletedEntry>,
}

impl Checkpoint {
    /// Decode a checkpoint file.
    ///
    /// An empty file is a fresh checkpoint. When the file holds several
    /// concatenated objects (or a complete object followed by a torn write)
    /// the last complete object wins.
    pub fn decode(text: &str) -> Result<Checkpoint, CheckpointDecodeError> {
        if text.trim().is_empty() {
            return Ok(Checkpoint::default());
        }

        let mut last = None;
        let stream = serde_json::Deserializer::from_str(text).into_iter::<Checkpoint>();
        for item in stream {
            match item {
                Ok(cp) => last = Some(cp),
                Err(e) => {
                    return match last {
                        Some(cp) => Ok(cp),
                        None => Err(CheckpointDecodeError::NoCompleteObject(e)),
                    };
                }
            }
        }

        Ok(last.unwrap_or_default())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Move the cursor forward. Returns false if `cursor` would move it back.
    pub fn advance_to(&mut self, cursor: i64) -> bool {
        if cursor < self.cursor {
            return false;
        }
        self.cursor = cursor;
        true
    }

    pub fn is_completed(&self, key: &str) -> bool {
        self.completed.contains_key(key)
    }

    /// Number of completed entries per status.
    pub fn status_counts(&self) -> BTreeMap<CompletedStatus, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.completed.values() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }
}

// ============================================================================
// Activity log
// ============================================================================

/// What a worker is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovering,
    Uploading,
    ProcessingDuplicates,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Discovering => "discovering",
            Phase::Uploading => "uploading",
            Phase::ProcessingDuplicates => "processing_duplicates",
        };
        f.write_str(s)
    }
}

/// Coarse classification of a worker-side error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transport,
    Timeout,
    Server,
    Validation,
    MalformedContent,
    DatabaseLocked,
    StuckUpload,
    Conversion,
    Io,
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transport => "transport",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Server => "server",
            ErrorClass::Validation => "validation",
            ErrorClass::MalformedContent => "malformed_content",
            ErrorClass::DatabaseLocked => "database_locked",
            ErrorClass::StuckUpload => "stuck_upload",
            ErrorClass::Conversion => "conversion",
            ErrorClass::Io => "io",
            ErrorClass::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable events written by a worker to its activity log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ActivityEvent {
    WorkerStarted {
        worker_id: u32,
        cursor: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_cursor: Option<i64>,
    },
    PhaseChanged {
        phase: Phase,
    },
    QueryExecuted {
        cursor: i64,
        rows: usize,
    },
    FilesFound {
        candidates: usize,
        duplicates: usize,
    },
    UploadSucceeded {
        path: String,
        hash: String,
        bytes: u64,
    },
    DuplicateSkipped {
        path: String,
    },
    ItemSkipped {
        path: String,
        status: CompletedStatus,
        reason: String,
    },
    BatchCompleted {
        uploaded: usize,
        duplicate: usize,
        error: usize,
        cursor: i64,
    },
    SkippedAhead {
        from: i64,
        to: i64,
    },
    Error {
        class: ErrorClass,
        message: String,
    },
    Completed {
        cursor: i64,
        uploaded_total: u64,
    },
}

impl ActivityEvent {
    /// Events that show forward progress even without an upload.
    pub fn is_progress_signal(&self) -> bool {
        matches!(
            self,
            ActivityEvent::QueryExecuted { .. }
                | ActivityEvent::FilesFound { .. }
                | ActivityEvent::BatchCompleted { .. }
                | ActivityEvent::UploadSucceeded { .. }
                | ActivityEvent::DuplicateSkipped { .. }
                | ActivityEvent::SkippedAhead { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ActivityDecodeError {
    #[error("empty activity line")]
    Empty,
    #[error("invalid activity line: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// One line of the activity log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ActivityEvent,
}

impl ActivityRecord {
    pub fn now(event: ActivityEvent) -> Self {
        ActivityRecord {
            ts: Utc::now(),
            event,
        }
    }

    /// Single-line JSON encoding, without the trailing newline.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> Result<ActivityRecord, ActivityDecodeError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ActivityDecodeError::Empty);
        }
        Ok(serde_json::from_str(line)?)
    }

    /// Decode every well-formed line of `text`, skipping torn or foreign
    /// lines.
    pub fn decode_all(text: &str) -> Vec<ActivityRecord> {
        text.lines()
            .filter_map(|l| ActivityRecord::decode(l).ok())
            .collect()
    }
}

// ============================================================================
// Fixes
// ============================================================================

/// Per-worker parameter overrides applied at (re)start.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_uploads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_threshold_secs: Option<u64>,
}

impl WorkerParams {
    pub fn is_empty(&self) -> bool {
        self.parallel_uploads.is_none()
            && self.batch_size.is_none()
            && self.stuck_threshold_secs.is_none()
    }

    /// Overlay `other` on top of `self`.
    pub fn merge(&self, other: &WorkerParams) -> WorkerParams {
        WorkerParams {
            parallel_uploads: other.parallel_uploads.or(self.parallel_uploads),
            batch_size: other.batch_size.or(self.batch_size),
            stuck_threshold_secs: other.stuck_threshold_secs.or(self.stuck_threshold_secs),
        }
    }
}

/// Where a source patch applies: `find` must occur exactly once in `file`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchLocation {
    pub file: PathBuf,
    pub find: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fix {
    Restart {
        #[serde(default)]
        params: WorkerParams,
    },
    ConfigChange {
        params: WorkerParams,
    },
    SourcePatch {
        location: PatchLocation,
        content: String,
    },
}

impl Fix {
    pub fn restart() -> Fix {
        Fix::Restart {
            params: WorkerParams::default(),
        }
    }

    pub fn fix_type(&self) -> FixType {
        match self {
            Fix::Restart { .. } => FixType::Restart,
            Fix::ConfigChange { .. } => FixType::ConfigChange,
            Fix::SourcePatch { .. } => FixType::SourcePatch,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixType {
    Restart,
    ConfigChange,
    SourcePatch,
}

impl fmt::Display for FixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FixType::Restart => "restart",
            FixType::ConfigChange => "config_change",
            FixType::SourcePatch => "source_patch",
        };
        f.write_str(s)
    }
}

impl FromStr for FixType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart" => Ok(FixType::Restart),
            "config_change" => Ok(FixType::ConfigChange),
            "source_patch" => Ok(FixType::SourcePatch),
            other => Err(format!("unknown fix type: {}", other)),
        }
    }
}

/// One entry of the supervisor's fix history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixAttemptRecord {
    pub worker_id: u32,
    pub timestamp: DateTime<Utc>,
    pub fix_type: FixType,
    pub root_cause: String,
    pub confidence: f64,
    /// The fix was applied without error.
    pub success: bool,
    /// Outcome of the post-fix verification; `None` while pending.
    #[serde(default)]
    pub verified_success: Option<bool>,
}

// ============================================================================
// Per-worker file layout
// ============================================================================

/// Paths of the files a worker shares with the supervisor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerFiles {
    dir: PathBuf,
    id: u32,
}

impl WorkerFiles {
    pub fn new(state_dir: impl Into<PathBuf>, id: u32) -> Self {
        WorkerFiles {
            dir: state_dir.into(),
            id,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state_dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("worker-{}.{}", self.id, suffix))
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.file("checkpoint.json")
    }

    pub fn activity_log(&self) -> PathBuf {
        self.file("activity.log")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.file("pid")
    }

    pub fn params(&self) -> PathBuf {
        self.file("params.json")
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.file("stderr.log")
    }

    pub fn reset_marker(&self) -> PathBuf {
        self.file("reset")
    }

    /// Extract the worker id from a checkpoint file name.
    pub fn id_from_checkpoint_name(name: &str) -> Option<u32> {
        name.strip_prefix("worker-")?
            .strip_suffix(".checkpoint.json")?
            .parse()
            .ok()
    }
}

// ============================================================================
// Tests
// ============================================================================
