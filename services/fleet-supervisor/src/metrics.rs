// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for the fleet supervisor
//!
//! Exports:
//! - Running and desired worker counts
//! - Disk utilisation of the catalog device
//! - Health score per worker
//! - Stuck detections, fixes by type, escalations
//! - Fix verification outcomes

use std::path::Path;

use prometheus::{
    CounterVec, Gauge, GaugeVec, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

// Metric definitions are constant; a failure here is a programming error.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref REGISTRY: Registry = Registry::new();

        pub static ref RUNNING_WORKERS: IntGauge = IntGauge::with_opts(
            Opts::new("fleet_supervisor_running_workers", "Worker processes alive")
        ).expect("valid metric name");

        pub static ref DESIRED_WORKERS: IntGauge = IntGauge::with_opts(
            Opts::new("fleet_supervisor_desired_workers", "Target worker count")
        ).expect("valid metric name");

        pub static ref DISK_UTILIZATION: Gauge = Gauge::with_opts(
            Opts::new(
                "fleet_supervisor_disk_utilization_percent",
                "Busy percentage of the catalog device"
            )
        ).expect("valid metric name");

        pub static ref HEALTH_SCORE: GaugeVec = GaugeVec::new(
            Opts::new("fleet_supervisor_health_score", "Latest health score per worker"),
            &["worker"]
        ).expect("valid metric name and labels");

        pub static ref STUCK_DETECTIONS: IntCounter = IntCounter::with_opts(
            Opts::new("fleet_supervisor_stuck_detections_total", "Stuck classifications")
        ).expect("valid metric name");

        pub static ref FIXES_TOTAL: CounterVec = CounterVec::new(
            Opts::new("fleet_supervisor_fixes_total", "Fixes applied by type and result"),
            &["fix_type", "result"]
        ).expect("valid metric name and labels");

        pub static ref ESCALATIONS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("fleet_supervisor_escalations_total", "Escalations by action"),
            &["action"]
        ).expect("valid metric name and labels");

        pub static ref VERIFICATIONS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("fleet_supervisor_verifications_total", "Fix verifications by outcome"),
            &["outcome"]
        ).expect("valid metric name and labels");
    }
}

pub use metrics_impl::{
    DESIRED_WORKERS, DISK_UTILIZATION, ESCALATIONS_TOTAL, FIXES_TOTAL, HEALTH_SCORE, REGISTRY,
    RUNNING_WORKERS, STUCK_DETECTIONS, VERIFICATIONS_TOTAL,
};

/// Register all metrics with the registry
///
/// Should be called once during application startup.
#[allow(clippy::expect_used)]
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(RUNNING_WORKERS.clone()))
        .expect("Failed to register RUNNING_WORKERS");
    REGISTRY
        .register(Box::new(DESIRED_WORKERS.clone()))
        .expect("Failed to register DESIRED_WORKERS");
    REGISTRY
        .register(Box::new(DISK_UTILIZATION.clone()))
        .expect("Failed to register DISK_UTILIZATION");
    REGISTRY
        .register(Box::new(HEALTH_SCORE.clone()))
        .expect("Failed to register HEALTH_SCORE");
    REGISTRY
        .register(Box::new(STUCK_DETECTIONS.clone()))
        .expect("Failed to register STUCK_DETECTIONS");
    REGISTRY
        .register(Box::new(FIXES_TOTAL.clone()))
        .expect("Failed to register FIXES_TOTAL");
    REGISTRY
        .register(Box::new(ESCALATIONS_TOTAL.clone()))
        .expect("Failed to register ESCALATIONS_TOTAL");
    REGISTRY
        .register(Box::new(VERIFICATIONS_TOTAL.clone()))
        .expect("Failed to register VERIFICATIONS_TOTAL");
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}

pub fn write_textfile(path: &Path) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    std::fs::write(&tmp, gather_metrics())?;
    std::fs::rename(&tmp, path)
}

pub fn set_fleet(running: usize, desired: usize) {
    RUNNING_WORKERS.set(running as i64);
    DESIRED_WORKERS.set(desired as i64);
}

pub fn set_disk_utilization(pct: Option<f64>) {
    // NaN marks an unknown sample
    DISK_UTILIZATION.set(pct.unwrap_or(f64::NAN));
}

pub fn set_health_score(worker_id: u32, score: f64) {
    HEALTH_SCORE
        .with_label_values(&[&worker_id.to_string()])
        .set(score);
}

pub fn record_stuck() {
    STUCK_DETECTIONS.inc();
}

pub fn record_fix(fix_type: &str, applied: bool) {
    let result = if applied { "applied" } else { "failed" };
    FIXES_TOTAL.with_label_values(&[fix_type, result]).inc();
}

pub fn record_escalation(action: &str) {
    ESCALATIONS_TOTAL.with_label_values(&[action]).inc();
}

pub fn record_verification(success: bool) {
    let outcome = if success { "resolved" } else { "still_stuck" };
    VERIFICATIONS_TOTAL.with_label_values(&[outcome]).inc();
}
