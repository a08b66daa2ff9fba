// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Migration Worker Library
//!
//! A worker owns one contiguous slice of the source catalog. It walks the
//! catalog by cursor, drops items the destination already holds, uploads
//! the rest through a bounded pool and records every outcome in a
//! crash-safe checkpoint that the fleet supervisor reads.
//!
//! # Modules
//!
//! - [`config`] - Worker configuration
//! - [`retry`] - Retry policy and the single retry wrapper
//! - [`checkpoint`] - Atomic, file-locked checkpoint store
//! - [`dedup`] - (hash, size) cache of destination contents
//! - [`catalog`] - Read-only catalog source and the cursor walker
//! - [`destination`] - Destination service client
//! - [`prepare`] - Conversion, hashing and metadata extraction
//! - [`pipeline`] - Bounded-concurrency upload pipeline
//! - [`activity`] - Activity log writer
//! - [`worker`] - The migration loop
//! - [`reconcile`] - Full-catalog completeness pass
//! - [`metrics`] - Prometheus metrics

pub mod activity;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod destination;
pub mod metrics;
pub mod pipeline;
pub mod prepare;
pub mod reconcile;
pub mod retry;
pub mod worker;

pub use config::WorkerConfig;
pub use worker::{Worker, WorkerOutcome};
