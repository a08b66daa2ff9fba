// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Deduplication cache
//!
//! An in-memory set of `(content hash, size)` pairs known to exist at the
//! destination. The first lookup triggers a full load; afterwards the set
//! is topped up by incremental listings past a `created_after` watermark
//! and by inserts after each successful upload.
//!
//! Reads are concurrent. Writers (uploads and the background refresh)
//! serialize on the same lock. At most one refresh runs at a time.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OnceCell, RwLock};

use crate::destination::{Destination, DestinationError};
use crate::metrics;

/// Refresh interval for a cache of `size` entries.
///
/// Bigger destinations are re-listed less often so the listing cost stays
/// bounded as the library grows.
pub fn refresh_interval(size: usize) -> Duration {
    match size {
        0..50_000 => Duration::from_secs(5 * 60),
        50_000..500_000 => Duration::from_secs(15 * 60),
        _ => Duration::from_secs(30 * 60),
    }
}

pub struct DedupCache {
    source: Arc<dyn Destination>,
    entries: RwLock<HashSet<(String, u64)>>,
    watermark: Mutex<Option<DateTime<Utc>>>,
    loaded: OnceCell<()>,
    refreshing: AtomicBool,
    last_refresh: Mutex<Option<Instant>>,
    load_failed_at: Mutex<Option<Instant>>,
}

impl DedupCache {
    pub fn new(source: Arc<dyn Destination>) -> Arc<Self> {
        Arc::new(Self {
            source,
            entries: RwLock::new(HashSet::new()),
            watermark: Mutex::new(None),
            loaded: OnceCell::new(),
            refreshing: AtomicBool::new(false),
            last_refresh: Mutex::new(None),
            load_failed_at: Mutex::new(None),
        })
    }

    /// Load the full listing once. Returns whether the cache is loaded.
    ///
    /// A failed load is not retried until the empty-cache refresh interval
    /// has passed.
    async fn ensure_loaded(&self) -> bool {
        if self.loaded.initialized() {
            return true;
        }
        {
            let failed_at = self.load_failed_at.lock().await;
            if failed_at.is_some_and(|at| at.elapsed() < refresh_interval(0)) {
                return false;
            }
        }

        let result = self
            .loaded
            .get_or_try_init(|| async {
                let n = self.refresh(false).await?;
                tracing::info!(entries = n, "Dedup cache loaded");
                Ok::<(), DestinationError>(())
            })
            .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retry_in_secs = refresh_interval(0).as_secs(),
                    "Dedup cache load failed, treating items as new"
                );
                *self.load_failed_at.lock().await = Some(Instant::now());
                false
            }
        }
    }

    /// Whether `(hash, size)` is known to exist at the destination.
    ///
    /// Until the initial load succeeds the answer is `false`; the upload
    /// then learns about the duplicate from the destination itself.
    pub async fn contains(&self, hash: &str, size: u64) -> bool {
        if !self.ensure_loaded().await {
            return false;
        }
        self.entries
            .read()
            .await
            .contains(&(hash.to_string(), size))
    }

    pub async fn insert(&self, hash: &str, size: u64) {
        let mut entries = self.entries.write().await;
        entries.insert((hash.to_string(), size));
        metrics::set_dedup_cache_size(entries.len());
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Re-list the destination.
    ///
    /// Incremental refreshes only fetch entries past the watermark and
    /// merge them; a full refresh replaces the set. An incremental refresh
    /// without a watermark is a full one. Returns the number of entries
    /// fetched.
    pub async fn refresh(&self, incremental: bool) -> Result<usize, DestinationError> {
        let after = if incremental {
            *self.watermark.lock().await
        } else {
            None
        };

        let fetched = self.source.list_hashes(after).await?;
        let count = fetched.len();
        let newest = fetched.iter().map(|e| e.created_at).max();

        {
            let mut entries = self.entries.write().await;
            if after.is_none() {
                // Keep local inserts that the listing may not reflect yet.
                let mut fresh: HashSet<(String, u64)> =
                    fetched.into_iter().map(|e| (e.hash, e.size)).collect();
                if incremental {
                    fresh.extend(entries.drain());
                }
                *entries = fresh;
            } else {
                entries.extend(fetched.into_iter().map(|e| (e.hash, e.size)));
            }
            metrics::set_dedup_cache_size(entries.len());
        }

        if let Some(newest) = newest {
            let mut watermark = self.watermark.lock().await;
            if watermark.is_none_or(|w| newest > w) {
                *watermark = Some(newest);
            }
        }
        *self.last_refresh.lock().await = Some(Instant::now());

        tracing::debug!(incremental, fetched = count, "Dedup cache refreshed");
        Ok(count)
    }

    /// Whether the size-scaled refresh interval has elapsed.
    pub async fn refresh_due(&self) -> bool {
        if self.loaded.get().is_none() {
            return false;
        }
        let size = self.len().await;
        match *self.last_refresh.lock().await {
            Some(at) => at.elapsed() >= refresh_interval(size),
            None => true,
        }
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Start an incremental refresh on a background task if one is due and
    /// none is already running. Returns whether a refresh was started.
    pub async fn maybe_refresh_in_background(self: &Arc<Self>) -> bool {
        if !self.refresh_due().await {
            return false;
        }
        self.spawn_refresh()
    }

    /// Start an incremental refresh unless one is already running.
    pub fn spawn_refresh(self: &Arc<Self>) -> bool {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = cache.refresh(true).await {
                tracing::warn!(error = %e, "Background dedup refresh failed");
            }
            cache.refreshing.store(false, Ordering::SeqCst);
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::HashEntry;
    use crate::destination::mock::MockDestination;
    use chrono::TimeZone;

    fn entry(hash: &str, size: u64, minute: u32) -> HashEntry {
        HashEntry {
            hash: hash.to_string(),
            size,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap(),
        }
    }

    #[test]
    fn test_refresh_interval_grows_with_size() {
        assert!(refresh_interval(10) < refresh_interval(100_000));
        assert!(refresh_interval(100_000) < refresh_interval(1_000_000));
    }

    #[tokio::test]
    async fn test_lazy_full_load_on_first_lookup() {
        let dest = Arc::new(MockDestination::default());
        dest.hashes.lock().await.push(entry("aa", 10, 1));
        let cache = DedupCache::new(dest.clone());

        assert_eq!(dest.list_calls.load(Ordering::SeqCst), 0);
        assert!(cache.contains("aa", 10).await);
        assert!(!cache.contains("aa", 11).await);
        assert_eq!(dest.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_incremental_refresh_uses_watermark() {
        let dest = Arc::new(MockDestination::default());
        dest.hashes.lock().await.push(entry("aa", 10, 1));
        let cache = DedupCache::new(dest.clone());
        assert!(cache.contains("aa", 10).await);

        dest.hashes.lock().await.push(entry("bb", 20, 5));
        let fetched = cache.refresh(true).await.unwrap();
        assert_eq!(fetched, 1);
        assert!(cache.contains("bb", 20).await);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_full_refresh_replaces_set() {
        let dest = Arc::new(MockDestination::default());
        dest.hashes.lock().await.push(entry("aa", 10, 1));
        let cache = DedupCache::new(dest.clone());
        cache.insert("local", 1).await;
        assert!(cache.contains("aa", 10).await);

        dest.hashes.lock().await.clear();
        dest.hashes.lock().await.push(entry("cc", 30, 2));
        cache.refresh(false).await.unwrap();
        assert!(!cache.contains("aa", 10).await);
        assert!(!cache.contains("local", 1).await);
        assert!(cache.contains("cc", 30).await);
    }

    #[tokio::test]
    async fn test_insert_is_visible() {
        let dest = Arc::new(MockDestination::default());
        let cache = DedupCache::new(dest);
        cache.insert("dd", 40).await;
        assert!(cache.contains("dd", 40).await);
    }

    #[tokio::test]
    async fn test_only_one_background_refresh() {
        let dest = Arc::new(MockDestination::default());
        let cache = DedupCache::new(dest);
        cache.refreshing.store(true, Ordering::SeqCst);
        assert!(!cache.spawn_refresh());
        cache.refreshing.store(false, Ordering::SeqCst);
        assert!(cache.spawn_refresh());
    }

    #[tokio::test]
    async fn test_failed_load_is_not_retried_per_lookup() {
        let dest = Arc::new(MockDestination::default());
        dest.hashes.lock().await.push(entry("aa", 10, 1));
        dest.listing_down.store(true, Ordering::SeqCst);
        let cache = DedupCache::new(dest.clone());

        assert!(!cache.contains("aa", 10).await);
        assert!(!cache.contains("aa", 10).await);
        assert!(!cache.contains("bb", 20).await);
        assert_eq!(dest.list_calls.load(Ordering::SeqCst), 1);

        // Listing is back, but the retry waits out the interval.
        dest.listing_down.store(false, Ordering::SeqCst);
        assert!(!cache.contains("aa", 10).await);
        assert_eq!(dest.list_calls.load(Ordering::SeqCst), 1);

        *cache.load_failed_at.lock().await = None;
        assert!(cache.contains("aa", 10).await);
        assert_eq!(dest.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_not_due_before_load() {
        let dest = Arc::new(MockDestination::default());
        let cache = DedupCache::new(dest);
        assert!(!cache.refresh_due().await);
        assert!(!cache.contains("x", 1).await);
        assert!(!cache.refresh_due().await);
    }
}
