//! The CI wait/fix retry loop, invoked once per approved PR: poll checks,
//! invoke the fix agent, push, re-poll, escalate on exhaustion.

use std::time::Duration;

use hydra_core::{PrInfo, ReviewResult, ShutdownSignal};
use hydra_executor::executor::Executor;
use hydra_github::{CheckConclusion, GitHubClient};
use hydra_worktree::WorktreeManager;

use crate::context::PhaseContext;
use crate::reviewer::ReviewerRunner;
use crate::runner::PhaseError;
use hydra_bus::EventBus;
use hydra_executor::stream_reader::{LiveProcessSet, StreamReaderConfig};

/// Polls are grouped as: in-progress checks keep polling forever (up to the
/// overall timeout); an empty check-run list is given this many polls of
/// grace before being treated as failure (CI may not have started
/// reporting yet).
const MISSING_SUITE_GRACE_POLLS: u32 = 3;

pub struct CiWaitConfig {
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_fix_attempts: u32,
}

#[derive(Debug, Clone)]
pub enum CiOutcome {
    /// CI passed; the PR should be merged.
    Approved,
    /// CI never passed after `max_fix_attempts` fix rounds (or the fix
    /// agent gave up); the issue should be escalated to HITL.
    Escalated { summary: String },
}

/// Polls check runs for `pr` until they all conclude successfully, any
/// conclude in failure, or `timeout_secs` elapses. Honors `shutdown`,
/// returning the best-known state immediately if it fires.
pub async fn wait_for_ci(
    client: &GitHubClient,
    pr: &PrInfo,
    config: &CiWaitConfig,
    shutdown: &ShutdownSignal,
) -> (bool, String) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.timeout_secs);
    let mut interval = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));
    let mut rx = shutdown.subscribe();
    let mut empty_polls = 0u32;

    loop {
        tokio::select! {
            _ = rx.recv() => {
                return (false, "shutdown requested while waiting for CI".to_string());
            }
            _ = tokio::time::sleep_until(deadline) => {
                return (false, "timed out waiting for CI checks".to_string());
            }
            _ = interval.tick() => {
                let runs = match client.list_check_runs(pr.number).await {
                    Ok(runs) => runs,
                    Err(e) => {
                        return (false, format!("could not fetch check runs: {e}"));
                    }
                };

                if runs.is_empty() {
                    empty_polls += 1;
                    if empty_polls >= MISSING_SUITE_GRACE_POLLS {
                        return (false, "no check suite reported".to_string());
                    }
                    continue;
                }

                let pending: Vec<_> = runs
                    .iter()
                    .filter(|r| r.conclusion == CheckConclusion::Pending)
                    .collect();
                if !pending.is_empty() {
                    continue;
                }

                let failed: Vec<&str> = runs
                    .iter()
                    .filter(|r| r.conclusion == CheckConclusion::Failure)
                    .map(|r| r.name.as_str())
                    .collect();
                if failed.is_empty() {
                    return (true, "all checks passed".to_string());
                }
                return (false, format!("failing checks: {}", failed.join(", ")));
            }
        }
    }
}

/// Runs the full wait/fix/push retry cycle for `pr`, mutating `result` in
/// place (`ci_passed`, `ci_fix_attempts`) as `review_phase.py::wait_and_fix_ci`
/// does, and returning whether the PR should be merged.
#[allow(clippy::too_many_arguments)]
pub async fn wait_and_fix_ci(
    reviewer: &ReviewerRunner,
    executor: &dyn Executor,
    bus: Option<&EventBus>,
    live: &LiveProcessSet,
    stream_config: &StreamReaderConfig,
    ctx: &PhaseContext,
    client: &GitHubClient,
    worktree: &WorktreeManager,
    pr: &PrInfo,
    config: &CiWaitConfig,
    shutdown: &ShutdownSignal,
    result: &mut ReviewResult,
) -> Result<CiOutcome, PhaseError> {
    let mut summary = String::new();

    for attempt in 0..=config.max_fix_attempts {
        let (passed, last_summary) = wait_for_ci(client, pr, config, shutdown).await;
        summary = last_summary;
        if passed {
            result.ci_passed = true;
            return Ok(CiOutcome::Approved);
        }

        if attempt >= config.max_fix_attempts {
            break;
        }

        let fix_result = reviewer
            .fix_ci(
                executor,
                bus,
                live,
                stream_config,
                ctx,
                pr,
                &summary,
                attempt + 1,
            )
            .await?;
        result.ci_fix_attempts += 1;

        if !fix_result.fixes_made {
            break;
        }

        let worktree_path = ctx
            .worktree_path
            .clone()
            .expect("ci-fix requires a worktree");
        if worktree.push_branch(&worktree_path, &pr.branch).await.is_err() {
            break;
        }
    }

    result.ci_passed = false;
    Ok(CiOutcome::Escalated { summary })
}
