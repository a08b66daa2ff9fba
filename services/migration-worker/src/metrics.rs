// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for the migration worker
//!
//! Exports:
//! - Items processed by outcome (uploaded, duplicate, skipped, error)
//! - Bytes uploaded
//! - Retries by operation
//! - Batch duration
//! - Dedup cache size
//!
//! A worker has no HTTP listener, so the rendered metrics are written to a
//! textfile-collector file after every batch.

use std::path::Path;

use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};

// Metric definitions are constant; a failure here is a programming error.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        /// Registry for all worker metrics
        pub static ref REGISTRY: Registry = Registry::new();

        /// Items by terminal outcome
        pub static ref ITEMS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("migration_worker_items_total", "Items processed by outcome"),
            &["outcome"]
        ).expect("valid metric name and labels");

        /// Bytes successfully uploaded
        pub static ref BYTES_UPLOADED: Counter = Counter::with_opts(
            Opts::new("migration_worker_bytes_uploaded_total", "Total bytes uploaded")
        ).expect("valid metric name");

        /// Retries by operation
        pub static ref RETRIES_TOTAL: CounterVec = CounterVec::new(
            Opts::new("migration_worker_retries_total", "Retried attempts by operation"),
            &["op"]
        ).expect("valid metric name and labels");

        /// Batch wall-clock time
        pub static ref BATCH_DURATION: Histogram = Histogram::with_opts(
            HistogramOpts::new(
                "migration_worker_batch_duration_seconds",
                "Batch processing time in seconds"
            )
            .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0])
        ).expect("valid histogram opts");

        /// Entries in the dedup cache
        pub static ref DEDUP_CACHE_SIZE: IntGauge = IntGauge::with_opts(
            Opts::new("migration_worker_dedup_cache_entries", "Entries in the dedup cache")
        ).expect("valid metric name");

        /// Current checkpoint cursor
        pub static ref CURSOR: Gauge = Gauge::with_opts(
            Opts::new("migration_worker_cursor", "Current checkpoint cursor")
        ).expect("valid metric name");
    }
}

pub use metrics_impl::{
    BATCH_DURATION, BYTES_UPLOADED, CURSOR, DEDUP_CACHE_SIZE, ITEMS_TOTAL, REGISTRY,
    RETRIES_TOTAL,
};

/// Register all metrics with the registry
///
/// Should be called once during application startup.
#[allow(clippy::expect_used)]
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(ITEMS_TOTAL.clone()))
        .expect("Failed to register ITEMS_TOTAL");
    REGISTRY
        .register(Box::new(BYTES_UPLOADED.clone()))
        .expect("Failed to register BYTES_UPLOADED");
    REGISTRY
        .register(Box::new(RETRIES_TOTAL.clone()))
        .expect("Failed to register RETRIES_TOTAL");
    REGISTRY
        .register(Box::new(BATCH_DURATION.clone()))
        .expect("Failed to register BATCH_DURATION");
    REGISTRY
        .register(Box::new(DEDUP_CACHE_SIZE.clone()))
        .expect("Failed to register DEDUP_CACHE_SIZE");
    REGISTRY
        .register(Box::new(CURSOR.clone()))
        .expect("Failed to register CURSOR");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

/// Write the rendered metrics to `path` via temp file and rename.
pub fn write_textfile(path: &Path) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    std::fs::write(&tmp, gather_metrics())?;
    std::fs::rename(&tmp, path)
}

pub fn record_uploaded(bytes: u64) {
    ITEMS_TOTAL.with_label_values(&["uploaded"]).inc();
    BYTES_UPLOADED.inc_by(bytes as f64);
}

pub fn record_duplicate(count: usize) {
    ITEMS_TOTAL
        .with_label_values(&["duplicate"])
        .inc_by(count as f64);
}

/// Unprocessable items (missing file, insufficient metadata)
pub fn record_skipped() {
    ITEMS_TOTAL.with_label_values(&["skipped"]).inc();
}

pub fn record_error() {
    ITEMS_TOTAL.with_label_values(&["error"]).inc();
}

pub fn record_retry(op: &str) {
    RETRIES_TOTAL.with_label_values(&[op]).inc();
}

pub fn record_batch_duration(secs: f64) {
    BATCH_DURATION.observe(secs);
}

pub fn set_dedup_cache_size(n: usize) {
    DEDUP_CACHE_SIZE.set(n as i64);
}

pub fn set_cursor(cursor: i64) {
    CURSOR.set(cursor as f64);
}
