// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Catalog access and the cursor walker
//!
//! The walker pages through the catalog with an indexed range query
//! (`id > cursor ORDER BY id LIMIT n`), so the cost of a page does not
//! depend on how far the walk has progressed. Each page is filtered by a
//! size-only existence check against the destination before any item is
//! hashed.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OpenFlags, params};
use thiserror::Error;

use migration_types::{CatalogItem, ErrorClass};

use crate::destination::{Destination, DestinationError, ExistenceQuery, mime_for};
use crate::retry::{RetryPolicy, Retryable, retry};

/// Range query used when no override is configured.
///
/// Parameters: `?1` cursor (exclusive), `?2` end (inclusive), `?3` limit.
pub const DEFAULT_QUERY: &str = "SELECT id, path, format, size FROM catalog \
     WHERE id > ?1 AND id <= ?2 ORDER BY id LIMIT ?3";

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Catalog returned out-of-order id {id} after cursor {cursor}")]
    OutOfOrder { id: i64, cursor: i64 },
    #[error("Catalog connection lock poisoned")]
    Poisoned,
    #[error("Catalog query task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CatalogError {
    /// Class reported in the activity log
    pub fn class(&self) -> ErrorClass {
        match self {
            CatalogError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorClass::DatabaseLocked,
                ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
                | ErrorCode::DiskFull
                | ErrorCode::ReadOnly
                | ErrorCode::PermissionDenied => ErrorClass::Io,
                _ => ErrorClass::Internal,
            },
            _ => ErrorClass::Internal,
        }
    }
}

impl Retryable for CatalogError {
    fn is_retryable(&self) -> bool {
        match self {
            CatalogError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            _ => false,
        }
    }
}

/// Read-only source of catalog rows
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Up to `limit` items with `cursor < id <= end`, ordered by id.
    async fn fetch_after(
        &self,
        cursor: i64,
        end: Option<i64>,
        limit: usize,
    ) -> Result<Vec<CatalogItem>, CatalogError>;
}

/// Catalog backed by a SQLite file shared with other readers
pub struct SqliteCatalog {
    conn: Arc<Mutex<Connection>>,
    query: String,
}

impl SqliteCatalog {
    /// Open the catalog read-only.
    pub fn open(
        path: &Path,
        query: Option<String>,
        busy_timeout: Duration,
    ) -> Result<Self, CatalogError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;

        let query = query.unwrap_or_else(|| DEFAULT_QUERY.to_string());
        // Fail at startup rather than on the first batch.
        conn.prepare(&query)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            query,
        })
    }
}

#[async_trait]
impl CatalogSource for SqliteCatalog {
    async fn fetch_after(
        &self,
        cursor: i64,
        end: Option<i64>,
        limit: usize,
    ) -> Result<Vec<CatalogItem>, CatalogError> {
        let conn = Arc::clone(&self.conn);
        let query = self.query.clone();
        // The busy timeout may block for seconds while a writer holds the file.
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| CatalogError::Poisoned)?;
            let mut stmt = conn.prepare_cached(&query)?;
            let rows = stmt.query_map(
                params![cursor, end.unwrap_or(i64::MAX), limit as i64],
                |row| {
                    let size: Option<i64> = row.get(3)?;
                    let format: Option<String> = row.get(2)?;
                    Ok(CatalogItem {
                        id: row.get(0)?,
                        path: row.get(1)?,
                        format: format.unwrap_or_default().to_ascii_lowercase(),
                        size: size.unwrap_or(0).max(0) as u64,
                    })
                },
            )?;

            let mut items = Vec::with_capacity(limit);
            for row in rows {
                items.push(row?);
            }
            Ok(items)
        })
        .await?
    }
}

/// One page of the walk
#[derive(Debug, Default)]
pub struct Page {
    /// Items the destination does not report as present
    pub candidates: Vec<CatalogItem>,
    /// Items excluded by the size-only existence check
    pub duplicates: Vec<CatalogItem>,
    /// Highest identifier in the page
    pub next_cursor: i64,
    /// Rows returned by the query
    pub rows: usize,
}

impl Page {
    pub fn is_full(&self, batch_size: usize) -> bool {
        self.rows >= batch_size
    }
}

/// Cursor-based paginated reader over the catalog
pub struct CatalogWalker {
    source: Arc<dyn CatalogSource>,
    destination: Arc<dyn Destination>,
    batch_size: usize,
    existence_batch: usize,
    end_cursor: Option<i64>,
    read_policy: RetryPolicy,
    check_policy: RetryPolicy,
}

impl CatalogWalker {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        destination: Arc<dyn Destination>,
        batch_size: usize,
        existence_batch: usize,
        end_cursor: Option<i64>,
    ) -> Self {
        Self {
            source,
            destination,
            batch_size,
            existence_batch: existence_batch.max(1),
            end_cursor,
            read_policy: RetryPolicy::catalog(),
            check_policy: RetryPolicy::upload(2, Duration::from_secs(1)),
        }
    }

    pub fn with_policies(mut self, read: RetryPolicy, check: RetryPolicy) -> Self {
        self.read_policy = read;
        self.check_policy = check;
        self
    }

    pub fn end_cursor(&self) -> Option<i64> {
        self.end_cursor
    }

    /// Fetch the next page after `cursor`. `None` means the walk is over.
    pub async fn next_page(&self, cursor: i64) -> Result<Option<Page>, CatalogError> {
        if self.end_cursor.is_some_and(|end| cursor >= end) {
            return Ok(None);
        }

        let items = retry(&self.read_policy, "catalog.fetch", || {
            self.source
                .fetch_after(cursor, self.end_cursor, self.batch_size)
        })
        .await?;

        if items.is_empty() {
            return Ok(None);
        }

        let mut next_cursor = cursor;
        for item in &items {
            if item.id <= cursor {
                return Err(CatalogError::OutOfOrder {
                    id: item.id,
                    cursor,
                });
            }
            next_cursor = next_cursor.max(item.id);
        }

        let rows = items.len();
        let exists = self.check_existence(&items).await;

        let mut page = Page {
            next_cursor,
            rows,
            ..Default::default()
        };
        for (item, present) in items.into_iter().zip(exists) {
            if present {
                page.duplicates.push(item);
            } else {
                page.candidates.push(item);
            }
        }

        tracing::debug!(
            cursor,
            next_cursor,
            rows,
            candidates = page.candidates.len(),
            duplicates = page.duplicates.len(),
            "Fetched catalog page"
        );
        Ok(Some(page))
    }

    /// Size-only existence check in chunks of `existence_batch`.
    ///
    /// A chunk whose check fails is treated as all-new; the upload path
    /// still recognises duplicates from the destination's answer.
    async fn check_existence(&self, items: &[CatalogItem]) -> Vec<bool> {
        let mut out = Vec::with_capacity(items.len());
        for chunk in items.chunks(self.existence_batch) {
            let queries: Vec<ExistenceQuery> = chunk
                .iter()
                .map(|item| ExistenceQuery {
                    size: item.size,
                    mime_type: mime_for(&item.format).to_string(),
                    extension: item.format.clone(),
                    hash: None,
                })
                .collect();

            let destination = &self.destination;
            let queries = &queries;
            let result = retry(&self.check_policy, "destination.exists", || async move {
                let results = destination.check_exists(queries).await?;
                if results.len() != queries.len() {
                    return Err(DestinationError::Protocol(format!(
                        "existence check answered {} of {} items",
                        results.len(),
                        queries.len()
                    )));
                }
                Ok(results)
            })
            .await;

            match result {
                Ok(results) => {
                    for r in results {
                        if let Some(err) = &r.error {
                            tracing::debug!(error = %err, "Existence check error for item");
                        }
                        out.push(r.exists && r.error.is_none());
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        items = chunk.len(),
                        "Existence check failed, treating chunk as new"
                    );
                    out.extend(std::iter::repeat_n(false, chunk.len()));
                }
            }
        }
        out
    }
}
