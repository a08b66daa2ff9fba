// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Fleet autoscaler
//!
//! Grows the fleet while the catalog device has headroom and shrinks it
//! when the device is saturated and a worker is confirmed stuck.
//! Saturation alone never shrinks the fleet. Workers that were assigned
//! work but lost their process are restarted up to the desired count, and
//! at least one worker runs while there is work left.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::SupervisorConfig;

/// What the supervisor knows about the fleet this cycle
#[derive(Clone, Debug, Default)]
pub struct ScaleInputs {
    /// Busy percentage of the catalog device, if known
    pub utilization: Option<f64>,
    pub running: BTreeSet<u32>,
    /// Every worker id with state on disk
    pub known: BTreeSet<u32>,
    /// Running workers classified stuck
    pub stuck: BTreeSet<u32>,
    /// Workers with a checkpoint, not completed, not paused, not running
    pub orphans: BTreeSet<u32>,
    pub completed: BTreeSet<u32>,
    /// Paused by remediation; never started here
    pub paused: BTreeSet<u32>,
    /// A worker recently completed having found nothing
    pub recent_empty_completion: bool,
}

impl ScaleInputs {
    fn all_completed(&self) -> bool {
        !self.known.is_empty() && self.known.iter().all(|id| self.completed.contains(id))
    }

    /// Whether starting another worker could find anything to do
    fn work_remaining(&self) -> bool {
        !self.all_completed() && !self.recent_empty_completion
    }

    fn next_unused_id(&self) -> u32 {
        self.known
            .iter()
            .chain(self.running.iter())
            .max()
            .map_or(0, |id| id + 1)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScalePlan {
    pub desired: usize,
    pub kill: Option<u32>,
    pub spawn: Vec<u32>,
}

impl ScalePlan {
    pub fn is_empty(&self) -> bool {
        self.kill.is_none() && self.spawn.is_empty()
    }
}

#[derive(Debug)]
pub struct Autoscaler {
    desired: usize,
    bootstrapped: bool,
    last_scale_up: Option<DateTime<Utc>>,
    last_scale_down: Option<DateTime<Utc>>,
}

fn cooled(last: Option<DateTime<Utc>>, now: DateTime<Utc>, secs: u64) -> bool {
    last.is_none_or(|t| now - t >= ChronoDuration::seconds(secs as i64))
}

impl Autoscaler {
    pub fn new(desired: usize) -> Self {
        Self {
            desired,
            bootstrapped: false,
            last_scale_up: None,
            last_scale_down: None,
        }
    }

    pub fn desired(&self) -> usize {
        self.desired
    }

    /// Decide this cycle's kills and spawns. `desired` is updated in place.
    pub fn plan(
        &mut self,
        inputs: &ScaleInputs,
        config: &SupervisorConfig,
        now: DateTime<Utc>,
    ) -> ScalePlan {
        self.desired = self.desired.clamp(config.min_workers, config.max_workers);
        let mut plan = ScalePlan::default();
        let mut scaled_up = false;

        if let Some(util) = inputs.utilization {
            if util >= config.saturated_util_pct {
                if inputs.stuck.is_empty() {
                    tracing::debug!(util, "Disk saturated but no worker is stuck");
                } else if self.desired > config.min_workers
                    && cooled(self.last_scale_down, now, config.scale_down_cooldown_secs)
                {
                    self.desired -= 1;
                    self.last_scale_down = Some(now);
                    plan.kill = inputs.running.iter().next_back().copied();
                    tracing::info!(
                        util,
                        stuck = ?inputs.stuck,
                        desired = self.desired,
                        kill = ?plan.kill,
                        "Scaling down"
                    );
                }
            } else if util < config.normal_util_pct
                && self.desired < config.max_workers
                && inputs.running.len() >= self.desired
                && inputs.work_remaining()
                && cooled(self.last_scale_up, now, config.scale_up_cooldown_secs)
            {
                self.desired += 1;
                self.last_scale_up = Some(now);
                scaled_up = true;
                tracing::info!(util, desired = self.desired, "Scaling up");
            }
        }

        let staying = inputs.running.len() - usize::from(plan.kill.is_some());
        let mut capacity = self.desired.saturating_sub(staying);

        for id in &inputs.orphans {
            if capacity == 0 {
                break;
            }
            if inputs.running.contains(id) || inputs.paused.contains(id) {
                continue;
            }
            tracing::info!(worker_id = id, "Restarting worker with unfinished checkpoint");
            plan.spawn.push(*id);
            capacity -= 1;
        }

        if (scaled_up || !self.bootstrapped) && inputs.work_remaining() {
            let mut next = inputs.next_unused_id();
            while capacity > 0 {
                plan.spawn.push(next);
                next += 1;
                capacity -= 1;
                if !self.bootstrapped {
                    continue;
                }
                break;
            }
        }
        self.bootstrapped = true;

        if self.desired > 0 && staying == 0 && plan.spawn.is_empty() {
            if let Some(id) = self.fallback(inputs) {
                tracing::warn!(worker_id = id, "No worker running, starting one");
                plan.spawn.push(id);
            }
        }

        plan.desired = self.desired;
        plan
    }

    fn fallback(&self, inputs: &ScaleInputs) -> Option<u32> {
        if inputs.recent_empty_completion {
            tracing::warn!("Recent workers completed without finding anything, not restarting");
            return None;
        }
        if inputs.known.is_empty() {
            return Some(0);
        }
        inputs
            .known
            .iter()
            .find(|id| !inputs.completed.contains(id) && !inputs.paused.contains(id))
            .copied()
    }

    /// The planned kill did not take; count the worker as wanted again.
    pub fn revert_scale_down(&mut self) {
        self.desired += 1;
    }

    /// A scale-up spawn failed.
    pub fn revert_scale_up(&mut self) {
        self.desired = self.desired.saturating_sub(1);
    }
}
