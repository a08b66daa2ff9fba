// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Disk utilisation of the catalog device

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Column of `/proc/diskstats` holding milliseconds spent doing I/O
const IO_TICKS_FIELD: usize = 12;

#[async_trait]
pub trait DiskIoSource: Send + Sync {
    /// Busy percentage since the previous call. `None` when unknown,
    /// including on the first call.
    async fn utilization(&self) -> Option<f64>;
}

/// `io_ticks` for `device` in the contents of `/proc/diskstats`.
pub fn parse_diskstats(text: &str, device: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.get(2) != Some(&device) {
            return None;
        }
        fields.get(IO_TICKS_FIELD)?.parse().ok()
    })
}

pub struct ProcDiskStats {
    path: PathBuf,
    device: String,
    last: Mutex<Option<(Instant, u64)>>,
}

impl ProcDiskStats {
    pub fn new(device: String) -> Self {
        Self::with_path(PathBuf::from("/proc/diskstats"), device)
    }

    pub fn with_path(path: PathBuf, device: String) -> Self {
        Self {
            path,
            device,
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DiskIoSource for ProcDiskStats {
    async fn utilization(&self) -> Option<f64> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Cannot read diskstats");
                return None;
            }
        };
        let Some(ticks) = parse_diskstats(&text, &self.device) else {
            tracing::warn!(device = %self.device, "Device not found in diskstats");
            return None;
        };

        let now = Instant::now();
        let previous = self.last.lock().await.replace((now, ticks));
        let (then, prev_ticks) = previous?;
        let wall_ms = now.duration_since(then).as_millis() as f64;
        if wall_ms <= 0.0 {
            return None;
        }
        let busy_ms = ticks.saturating_sub(prev_ticks) as f64;
        Some((busy_ms / wall_ms * 100.0).clamp(0.0, 100.0))
    }
}

/// Used when no device is configured
pub struct NoDiskIo;

#[async_trait]
impl DiskIoSource for NoDiskIo {
    async fn utilization(&self) -> Option<f64> {
        None
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex as StdMutex;

    pub struct FixedDiskIo(pub StdMutex<Option<f64>>);

    impl FixedDiskIo {
        pub fn new(value: Option<f64>) -> Self {
            Self(StdMutex::new(value))
        }

        pub fn set(&self, value: Option<f64>) {
            *self.0.lock().unwrap() = value;
        }
    }

    #[async_trait]
    impl DiskIoSource for FixedDiskIo {
        async fn utilization(&self) -> Option<f64> {
            *self.0.lock().unwrap()
        }
    }
}
