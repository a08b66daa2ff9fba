// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Fleet Supervisor Library
//!
//! Watches a fleet of migration workers through the files they share with
//! it, restarts or reconfigures workers that stop making progress, and
//! sizes the fleet to what the catalog's disk can sustain.
//!
//! # Modules
//!
//! - [`config`] - Supervisor configuration and SIGUSR1 reload
//! - [`observe`] - Checkpoint and activity-log readers
//! - [`health`] - Health scores and stuck detection
//! - [`history`] - Fix history and root-cause ledger
//! - [`advisor`] - Fix advisors
//! - [`patch`] - Source patching with backup and rollback
//! - [`process`] - Worker process launcher
//! - [`diskio`] - Disk utilisation sampling
//! - [`remediation`] - Per-worker remediation state machine
//! - [`autoscaler`] - Fleet sizing
//! - [`supervisor`] - The control loop
//! - [`metrics`] - Prometheus metrics

pub mod advisor;
pub mod autoscaler;
pub mod config;
pub mod diskio;
pub mod health;
pub mod history;
pub mod metrics;
pub mod observe;
pub mod patch;
pub mod process;
pub mod remediation;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use supervisor::{FleetStatus, Supervisor};
