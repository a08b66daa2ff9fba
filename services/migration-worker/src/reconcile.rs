// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Completeness check across all worker checkpoints
//!
//! Skip-ahead and size-only duplicate detection trade completeness for
//! speed. This pass walks the whole catalog once and reports every item
//! that no checkpoint accounts for, plus every item recorded as skipped.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use migration_types::{Checkpoint, CompletedStatus, WorkerFiles, catalog_key};

use crate::catalog::{CatalogError, CatalogSource};
use crate::checkpoint::{self, CheckpointError};

/// Default cap on the number of missing items listed in a report
pub const DEFAULT_SAMPLE_LIMIT: usize = 100;

#[derive(Debug, Default, Serialize)]
pub struct MissingItem {
    pub id: i64,
    pub path: String,
}

#[derive(Debug, Default, Serialize)]
pub struct SkippedItem {
    pub worker_id: u32,
    pub key: String,
    pub path: String,
    pub reason: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    /// Checkpoints read
    pub workers: Vec<u32>,
    /// Catalog rows walked
    pub total: u64,
    /// Rows with an entry in some checkpoint
    pub accounted: u64,
    pub missing_count: u64,
    /// First `sample_limit` missing rows
    pub missing: Vec<MissingItem>,
    /// Entries recorded as skipped
    pub skipped: Vec<SkippedItem>,
}

impl ReconcileReport {
    pub fn is_complete(&self) -> bool {
        self.missing_count == 0
    }
}

/// Load every `worker-<id>.checkpoint.json` under `state_dir`.
pub fn load_checkpoints(state_dir: &Path) -> Result<Vec<(u32, Checkpoint)>, CheckpointError> {
    let entries = std::fs::read_dir(state_dir).map_err(|source| CheckpointError::Io {
        path: state_dir.to_path_buf(),
        source,
    })?;

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(WorkerFiles::id_from_checkpoint_name) else {
            continue;
        };
        let cp = checkpoint::load(&WorkerFiles::new(state_dir, id).checkpoint())?;
        out.push((id, cp));
    }
    out.sort_by_key(|(id, _)| *id);
    Ok(out)
}

/// Walk the catalog and compare it with the given checkpoints.
pub async fn reconcile(
    catalog: Arc<dyn CatalogSource>,
    checkpoints: &[(u32, Checkpoint)],
    page_size: usize,
    sample_limit: usize,
) -> Result<ReconcileReport, CatalogError> {
    let mut keys: HashSet<&str> = HashSet::new();
    let mut paths: HashSet<&str> = HashSet::new();
    let mut report = ReconcileReport::default();

    for (worker_id, cp) in checkpoints {
        report.workers.push(*worker_id);
        for (key, entry) in &cp.completed {
            keys.insert(key.as_str());
            paths.insert(entry.path.as_str());
            if entry.status == CompletedStatus::Skipped {
                report.skipped.push(SkippedItem {
                    worker_id: *worker_id,
                    key: key.clone(),
                    path: entry.path.clone(),
                    reason: entry.reason.clone(),
                });
            }
        }
    }

    let page_size = page_size.max(1);
    let mut cursor = i64::MIN;
    loop {
        let items = catalog.fetch_after(cursor, None, page_size).await?;
        let Some(last) = items.last() else {
            break;
        };
        cursor = last.id;

        for item in &items {
            report.total += 1;
            if keys.contains(catalog_key(item.id).as_str()) || paths.contains(item.path.as_str()) {
                report.accounted += 1;
            } else {
                report.missing_count += 1;
                if report.missing.len() < sample_limit {
                    report.missing.push(MissingItem {
                        id: item.id,
                        path: item.path.clone(),
                    });
                }
            }
        }
    }

    tracing::info!(
        total = report.total,
        accounted = report.accounted,
        missing = report.missing_count,
        skipped = report.skipped.len(),
        "Reconciliation complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::mock::MockCatalog;
    use migration_types::CompletedEntry;

    fn checkpoint(entries: &[(&str, &str, CompletedStatus)]) -> Checkpoint {
        let mut cp = Checkpoint::default();
        for (key, path, status) in entries {
            cp.completed
                .insert(key.to_string(), CompletedEntry::new(*path, *status));
        }
        cp
    }

    #[tokio::test]
    async fn test_reports_unaccounted_items() {
        let catalog = Arc::new(MockCatalog::with_items(5, |_| 1));
        let cps = vec![
            (
                0,
                checkpoint(&[
                    ("catalog:1", "x", CompletedStatus::AlreadyExists),
                    ("abc", "Author 2/Book 2/book2.epub", CompletedStatus::Uploaded),
                ]),
            ),
            (
                1,
                checkpoint(&[("catalog:4", "Author 4/Book 4/book4.epub", CompletedStatus::Skipped)]),
            ),
        ];

        let report = reconcile(catalog, &cps, 2, 10).await.unwrap();
        assert_eq!(report.total, 5);
        assert_eq!(report.accounted, 3);
        assert_eq!(report.missing_count, 2);
        let missing: Vec<i64> = report.missing.iter().map(|m| m.id).collect();
        assert_eq!(missing, vec![3, 5]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].worker_id, 1);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_missing_sample_is_capped() {
        let catalog = Arc::new(MockCatalog::with_items(50, |_| 1));
        let report = reconcile(catalog, &[], 7, 3).await.unwrap();
        assert_eq!(report.missing_count, 50);
        assert_eq!(report.missing.len(), 3);
    }

    #[test]
    fn test_load_checkpoints_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = Checkpoint::default();
        cp.cursor = 9;
        std::fs::write(
            WorkerFiles::new(dir.path(), 3).checkpoint(),
            cp.encode().unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("worker-3.activity.log"), "").unwrap();
        std::fs::write(dir.path().join("fleet-status.json"), "{}").unwrap();

        let loaded = load_checkpoints(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, 3);
        assert_eq!(loaded[0].1.cursor, 9);
    }
}
