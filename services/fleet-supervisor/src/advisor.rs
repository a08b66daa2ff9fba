// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Fix advisors
//!
//! An advisor looks at a stuck worker and proposes a [`Fix`] with a root
//! cause and a confidence. [`HeuristicAdvisor`] works from the dominant
//! error class in the worker's recent activity. [`CommandAdvisor`] hands
//! the same context to an external program and falls back to the
//! heuristic when that program fails.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use migration_types::{ErrorClass, Fix, FixAttemptRecord, Phase, WorkerParams};

/// What the advisor is told about a stuck worker
#[derive(Clone, Debug, Serialize)]
pub struct AdviceContext {
    pub worker_id: u32,
    pub phase: Option<Phase>,
    pub idle_secs: u64,
    pub threshold_secs: u64,
    pub error_rate: f64,
    pub recent_errors: Vec<(ErrorClass, String)>,
    /// Overrides currently applied to the worker
    pub params: WorkerParams,
    pub recent_fixes: Vec<FixAttemptRecord>,
    /// Restarts have not helped with this cause before; propose something
    /// other than a plain restart if possible
    pub avoid_restart: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Advice {
    pub fix: Fix,
    pub root_cause: String,
    pub confidence: f64,
}

#[async_trait]
pub trait FixAdvisor: Send + Sync {
    async fn advise(&self, ctx: &AdviceContext) -> Advice;
}

/// Concurrency used when the worker runs with its built-in default
const ASSUMED_PARALLEL_UPLOADS: usize = 4;
const ASSUMED_BATCH_SIZE: usize = 500;

fn dominant_class(errors: &[(ErrorClass, String)]) -> Option<ErrorClass> {
    let mut counts: HashMap<ErrorClass, usize> = HashMap::new();
    for (class, _) in errors {
        *counts.entry(*class).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.as_str().cmp(a.0.as_str())))
        .map(|(class, _)| class)
}

fn halved(current: Option<usize>, assumed: usize) -> usize {
    (current.unwrap_or(assumed) / 2).max(1)
}

/// Rule-based advisor
#[derive(Debug, Default)]
pub struct HeuristicAdvisor;

impl HeuristicAdvisor {
    fn reduce_load(ctx: &AdviceContext, root_cause: String, confidence: f64) -> Advice {
        Advice {
            fix: Fix::ConfigChange {
                params: WorkerParams {
                    parallel_uploads: Some(halved(
                        ctx.params.parallel_uploads,
                        ASSUMED_PARALLEL_UPLOADS,
                    )),
                    ..ctx.params.clone()
                },
            },
            root_cause,
            confidence,
        }
    }
}

#[async_trait]
impl FixAdvisor for HeuristicAdvisor {
    async fn advise(&self, ctx: &AdviceContext) -> Advice {
        let advice = match dominant_class(&ctx.recent_errors) {
            Some(ErrorClass::StuckUpload) | Some(ErrorClass::Timeout) => Self::reduce_load(
                ctx,
                "uploads stall under current concurrency (timeout)".to_string(),
                0.6,
            ),
            Some(ErrorClass::DatabaseLocked) => Advice {
                fix: Fix::ConfigChange {
                    params: WorkerParams {
                        parallel_uploads: Some(halved(
                            ctx.params.parallel_uploads,
                            ASSUMED_PARALLEL_UPLOADS,
                        )),
                        batch_size: Some(halved(ctx.params.batch_size, ASSUMED_BATCH_SIZE)),
                        ..ctx.params.clone()
                    },
                },
                root_cause: "catalog database locked by concurrent readers".to_string(),
                confidence: 0.7,
            },
            Some(ErrorClass::Transport) | Some(ErrorClass::Server) => Advice {
                fix: Fix::restart(),
                root_cause: "destination unreachable or failing (transport)".to_string(),
                confidence: 0.5,
            },
            Some(ErrorClass::Conversion) => Self::reduce_load(
                ctx,
                "format conversion hangs (conversion)".to_string(),
                0.4,
            ),
            Some(other) => Advice {
                fix: Fix::restart(),
                root_cause: format!("repeated {} errors", other),
                confidence: 0.3,
            },
            None => Advice {
                fix: Fix::restart(),
                root_cause: match ctx.phase {
                    Some(Phase::Discovering) | None => {
                        "no progress during discovery without errors".to_string()
                    }
                    Some(_) => "no progress without errors".to_string(),
                },
                confidence: 0.3,
            },
        };

        // The heuristic has no source knowledge; the only alternative it can
        // offer to a restart is lighter load.
        if ctx.avoid_restart && matches!(advice.fix, Fix::Restart { .. }) {
            return Self::reduce_load(ctx, advice.root_cause, advice.confidence);
        }
        advice
    }
}

/// Advisor backed by an external command
///
/// The command is run through `sh -c`, receives the [`AdviceContext`] as
/// JSON on stdin and must print an [`Advice`] as JSON on stdout.
pub struct CommandAdvisor {
    command: String,
    timeout: Duration,
    fallback: Arc<dyn FixAdvisor>,
}

impl CommandAdvisor {
    pub fn new(command: String, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            fallback: Arc::new(HeuristicAdvisor),
        }
    }

    async fn ask(&self, ctx: &AdviceContext) -> anyhow::Result<Advice> {
        let input = serde_json::to_vec(ctx)?;
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("advisor timed out after {:?}", self.timeout))??;
        if !output.status.success() {
            anyhow::bail!("advisor exited with {}", output.status);
        }
        let advice: Advice = serde_json::from_slice(&output.stdout)?;
        if !(0.0..=1.0).contains(&advice.confidence) {
            anyhow::bail!("advisor confidence {} out of range", advice.confidence);
        }
        Ok(advice)
    }
}

#[async_trait]
impl FixAdvisor for CommandAdvisor {
    async fn advise(&self, ctx: &AdviceContext) -> Advice {
        match self.ask(ctx).await {
            Ok(advice) => advice,
            Err(e) => {
                tracing::warn!(
                    worker_id = ctx.worker_id,
                    error = %e,
                    "Advisor command failed, using heuristic"
                );
                self.fallback.advise(ctx).await
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use tokio::sync::Mutex;

    /// Returns scripted advice and records every context it saw
    pub struct MockAdvisor {
        pub advice: Mutex<Vec<Advice>>,
        pub seen: Mutex<Vec<AdviceContext>>,
    }

    impl MockAdvisor {
        pub fn always(advice: Advice) -> Self {
            Self {
                advice: Mutex::new(vec![advice]),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FixAdvisor for MockAdvisor {
        async fn advise(&self, ctx: &AdviceContext) -> Advice {
            self.seen.lock().await.push(ctx.clone());
            let mut advice = self.advice.lock().await;
            if advice.len() > 1 {
                advice.remove(0)
            } else {
                advice[0].clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(errors: &[ErrorClass]) -> AdviceContext {
        AdviceContext {
            worker_id: 1,
            phase: Some(Phase::Uploading),
            idle_secs: 4000,
            threshold_secs: 1800,
            error_rate: 0.5,
            recent_errors: errors.iter().map(|c| (*c, "x".to_string())).collect(),
            params: WorkerParams::default(),
            recent_fixes: Vec::new(),
            avoid_restart: false,
        }
    }

    #[tokio::test]
    async fn test_locked_database_lowers_load() {
        let advice = HeuristicAdvisor
            .advise(&ctx(&[
                ErrorClass::DatabaseLocked,
                ErrorClass::DatabaseLocked,
                ErrorClass::Server,
            ]))
            .await;
        match advice.fix {
            Fix::ConfigChange { params } => {
                assert_eq!(params.parallel_uploads, Some(2));
                assert_eq!(params.batch_size, Some(250));
            }
            other => panic!("unexpected fix {:?}", other),
        }
        assert!(advice.root_cause.contains("locked"));
    }

    #[tokio::test]
    async fn test_quiet_worker_gets_restart() {
        let advice = HeuristicAdvisor.advise(&ctx(&[])).await;
        assert_eq!(advice.fix, Fix::restart());
    }

    #[tokio::test]
    async fn test_avoid_restart_turns_into_config_change() {
        let mut c = ctx(&[ErrorClass::Server]);
        c.avoid_restart = true;
        c.params.parallel_uploads = Some(1);
        let advice = HeuristicAdvisor.advise(&c).await;
        assert_eq!(
            advice.fix,
            Fix::ConfigChange {
                params: WorkerParams {
                    parallel_uploads: Some(1),
                    ..Default::default()
                }
            }
        );
    }

    #[tokio::test]
    async fn test_command_advisor_parses_output() {
        let advisor = CommandAdvisor::new(
            r#"cat >/dev/null; echo '{"fix":{"type":"restart"},"root_cause":"leak","confidence":0.9}'"#
                .to_string(),
            Duration::from_secs(10),
        );
        let advice = advisor.advise(&ctx(&[])).await;
        assert_eq!(advice.root_cause, "leak");
        assert_eq!(advice.fix, Fix::restart());
    }

    #[tokio::test]
    async fn test_command_advisor_falls_back() {
        let advisor = CommandAdvisor::new("exit 3".to_string(), Duration::from_secs(10));
        let advice = advisor
            .advise(&ctx(&[ErrorClass::Timeout, ErrorClass::Timeout]))
            .await;
        assert!(advice.root_cause.contains("timeout"));
    }

    #[tokio::test]
    async fn test_command_advisor_times_out() {
        let advisor = CommandAdvisor::new("sleep 5".to_string(), Duration::from_millis(100));
        let advice = advisor.advise(&ctx(&[])).await;
        assert_eq!(advice.fix, Fix::restart());
    }
}
