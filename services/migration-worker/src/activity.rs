// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Activity log writer
//!
//! Appends one encoded [`ActivityRecord`] per line. The supervisor reads
//! nothing else to infer what a worker is doing, so write failures are
//! logged but never abort the migration.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use migration_types::{ActivityEvent, ActivityRecord};

pub struct ActivityLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl ActivityLog {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
        })
    }

    /// A log that drops every event.
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn emit(&self, event: ActivityEvent) {
        let record = ActivityRecord::now(event);
        let mut line = match record.encode() {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode activity record");
                return;
            }
        };
        line.push('\n');

        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            return;
        };
        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write activity log");
        }
    }
}
