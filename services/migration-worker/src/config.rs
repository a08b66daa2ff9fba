// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Worker configuration

use std::path::PathBuf;
use std::time::Duration;

use migration_types::WorkerFiles;

/// Default directory shared with the supervisor
pub const DEFAULT_STATE_DIR: &str = "/var/tmp/migration";

/// Default number of catalog rows per batch
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default number of concurrent uploads
pub const DEFAULT_PARALLEL_UPLOADS: usize = 4;

/// Default retry cap for a single upload
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default size of a batched existence check
pub const DEFAULT_EXISTENCE_BATCH: usize = 100;

/// Default seconds without byte progress before an upload is aborted
pub const DEFAULT_STUCK_UPLOAD_SECS: u64 = 300;

/// Default ceiling for a single upload attempt (seconds)
pub const DEFAULT_UPLOAD_HARD_TIMEOUT_SECS: u64 = 3600;

/// Default per-request HTTP timeout for non-upload calls (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// Default busy timeout for catalog reads (milliseconds)
pub const DEFAULT_DB_BUSY_TIMEOUT_MS: u64 = 5000;

/// Consecutive all-duplicate batches before skipping ahead
pub const DEFAULT_DUPLICATE_STREAK: u32 = 5;

/// Default cursor stride for skip-ahead; 0 disables it
pub const DEFAULT_SKIP_AHEAD_STRIDE: i64 = 10_000;

/// Formats the destination accepts without conversion
pub const DEFAULT_ACCEPTED_FORMATS: &[&str] = &["epub", "pdf", "mobi", "azw3", "cbz", "txt"];

/// Worker configuration
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Worker identity; selects the checkpoint and activity log
    pub worker_id: u32,
    /// Directory holding checkpoints, activity logs and pid files
    pub state_dir: PathBuf,
    /// Path to the source catalog database
    pub catalog_path: PathBuf,
    /// Override for the catalog range query
    pub catalog_query: Option<String>,
    /// Root directory the catalog paths are relative to
    pub library_root: PathBuf,
    /// Base URL of the destination service
    pub destination_url: String,
    /// Bearer token for the destination service
    pub api_token: Option<String>,
    /// Lowest cursor this worker starts from
    pub start_cursor: i64,
    /// Highest identifier this worker owns (inclusive)
    pub end_cursor: Option<i64>,
    /// Catalog rows per batch
    pub batch_size: usize,
    /// Concurrent uploads per process
    pub parallel_uploads: usize,
    /// Retries after the first upload attempt
    pub max_retries: u32,
    /// First backoff delay; doubles per retry
    pub retry_base_delay: Duration,
    /// Items per existence-check request
    pub existence_batch: usize,
    /// Per-request timeout for existence checks and hash listings
    pub http_timeout: Duration,
    /// No-progress window after which an upload is aborted
    pub stuck_upload: Duration,
    /// Ceiling for any single upload attempt
    pub upload_hard_timeout: Duration,
    /// Busy timeout for a catalog query
    pub db_busy_timeout: Duration,
    /// Stop after this long even if work remains
    pub max_runtime: Option<Duration>,
    /// Upload nothing, keep the checkpoint in memory
    pub dry_run: bool,
    /// Ask the destination to link to `library_root` instead of copying
    pub link_mode: bool,
    /// Formats uploaded as-is
    pub accepted_formats: Vec<String>,
    /// External converter, with `{input}` and `{output}` placeholders
    pub convert_command: Option<String>,
    /// Format produced by `convert_command`
    pub convert_target: String,
    /// Consecutive all-duplicate batches before skipping ahead
    pub duplicate_streak: u32,
    /// Cursor stride for skip-ahead; 0 disables it
    pub skip_ahead_stride: i64,
    /// Prometheus textfile written after every batch
    pub metrics_file: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            catalog_path: PathBuf::from("metadata.db"),
            catalog_query: None,
            library_root: PathBuf::from("."),
            destination_url: "http://127.0.0.1:8083".to_string(),
            api_token: None,
            start_cursor: 0,
            end_cursor: None,
            batch_size: DEFAULT_BATCH_SIZE,
            parallel_uploads: DEFAULT_PARALLEL_UPLOADS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_secs(2),
            existence_batch: DEFAULT_EXISTENCE_BATCH,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            stuck_upload: Duration::from_secs(DEFAULT_STUCK_UPLOAD_SECS),
            upload_hard_timeout: Duration::from_secs(DEFAULT_UPLOAD_HARD_TIMEOUT_SECS),
            db_busy_timeout: Duration::from_millis(DEFAULT_DB_BUSY_TIMEOUT_MS),
            max_runtime: None,
            dry_run: false,
            link_mode: false,
            accepted_formats: DEFAULT_ACCEPTED_FORMATS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            convert_command: None,
            convert_target: "epub".to_string(),
            duplicate_streak: DEFAULT_DUPLICATE_STREAK,
            skip_ahead_stride: DEFAULT_SKIP_AHEAD_STRIDE,
            metrics_file: None,
        }
    }
}

impl WorkerConfig {
    /// Files this worker shares with the supervisor
    pub fn files(&self) -> WorkerFiles {
        WorkerFiles::new(self.state_dir.clone(), self.worker_id)
    }

    /// Whether `format` can be uploaded without conversion
    pub fn is_accepted(&self, format: &str) -> bool {
        self.accepted_formats
            .iter()
            .any(|f| f.eq_ignore_ascii_case(format))
    }

    /// Check settings that would otherwise fail deep inside the loop
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch size must be > 0".to_string());
        }
        if self.parallel_uploads == 0 {
            return Err("parallel uploads must be > 0".to_string());
        }
        if self.existence_batch == 0 {
            return Err("existence batch must be > 0".to_string());
        }
        if self.skip_ahead_stride < 0 {
            return Err("skip-ahead stride must be >= 0".to_string());
        }
        if let Some(end) = self.end_cursor {
            if end < self.start_cursor {
                return Err(format!(
                    "end cursor {} is below start cursor {}",
                    end, self.start_cursor
                ));
            }
        }
        if let Some(cmd) = &self.convert_command {
            if !cmd.contains("{input}") || !cmd.contains("{output}") {
                return Err("convert command needs {input} and {output}".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_slice() {
        let config = WorkerConfig {
            start_cursor: 100,
            end_cursor: Some(50),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_convert_without_placeholders() {
        let config = WorkerConfig {
            convert_command: Some("ebook-convert in.mobi out.epub".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_is_accepted_ignores_case() {
        let config = WorkerConfig::default();
        assert!(config.is_accepted("EPUB"));
        assert!(!config.is_accepted("lit"));
    }

    #[test]
    fn test_files_use_worker_id() {
        let config = WorkerConfig {
            worker_id: 7,
            state_dir: PathBuf::from("/tmp/state"),
            ..Default::default()
        };
        assert_eq!(
            config.files().checkpoint(),
            PathBuf::from("/tmp/state/worker-7.checkpoint.json")
        );
    }
}
