// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Retry policy
//!
//! Every fallible operation that may be retried goes through [`retry`],
//! which consults the error's [`Retryable`] classification and sleeps
//! according to a [`RetryPolicy`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::metrics;

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Attempt cap and exponential backoff schedule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Uploads: 1 attempt plus `max_retries` retries at 2s, 4s, 8s...
    pub fn upload(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            base_delay,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Catalog reads that hit a locked database
    pub fn catalog() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }

    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
pub async fn retry<F, Fut, T, E>(policy: &RetryPolicy, op_name: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !e.is_retryable() || attempt >= policy.max_attempts {
                    if attempt > 1 {
                        tracing::warn!(
                            op = op_name,
                            attempts = attempt,
                            error = %e,
                            "Giving up after retries"
                        );
                    }
                    return Err(e);
                }

                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying"
                );
                metrics::record_retry(op_name);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
