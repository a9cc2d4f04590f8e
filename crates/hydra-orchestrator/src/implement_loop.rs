//! Implement loop: runs the coding agent against a `ready_label` issue,
//! pushes the branch, and opens (or updates, on a review-requested-changes
//! retry) the pull request.
//!
//! Crash recovery: issue numbers read from `StateStore::get_active_issue_numbers`
//! at startup are held active for exactly one tick of this loop, so a
//! restarted pipeline doesn't immediately re-dispatch work that may have
//! left a worktree or branch in a half-finished state; they're released
//! after that tick's fetch has excluded them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hydra_core::{Issue, LifecycleStage};
use hydra_phases::{ImplementerRunner, PhaseContext, PhaseError};
use tracing::warn;

use crate::shared::{Shared, ESCALATION_MARKER};

pub async fn run(shared: Arc<Shared>, once: bool) {
    let runner = Arc::new(ImplementerRunner::new());
    let mut ticker = tokio::time::interval(Duration::from_secs(shared.config.poll_interval_secs));
    let mut stop_rx = shared.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                if shared.shutdown.is_shutting_down() {
                    break;
                }
                tick(&shared, &runner).await;
                if once {
                    break;
                }
            }
        }
    }
}

async fn tick(shared: &Arc<Shared>, runner: &Arc<ImplementerRunner>) {
    let recovered: Vec<u64> = {
        let mut guard = shared.recovered_issues.lock().await;
        let v: Vec<u64> = guard.iter().copied().collect();
        guard.clear();
        v
    };
    for n in &recovered {
        shared.issue_store.mark_active(*n, LifecycleStage::Implement).await;
    }

    let max = 2 * shared.config.max_workers;
    let issues = shared.issue_store.get_implementable(max).await;

    for n in &recovered {
        shared.issue_store.mark_complete(*n).await;
    }

    if issues.is_empty() {
        return;
    }

    let shared2 = shared.clone();
    let runner2 = runner.clone();
    crate::batch::run_batch(
        issues,
        shared.config.max_workers,
        &shared.shutdown,
        &shared.active_handles,
        move |issue: Issue| {
            let shared = shared2.clone();
            let runner = runner2.clone();
            async move { implement_one(shared, runner, issue).await }
        },
    )
    .await;
}

async fn implement_one(shared: Arc<Shared>, runner: Arc<ImplementerRunner>, issue: Issue) {
    let n = issue.number;
    shared.issue_store.mark_active(n, LifecycleStage::Implement).await;

    let attempts = {
        let mut state = shared.state.lock().await;
        state.increment_issue_attempts(n)
    };
    if attempts > shared.config.max_issue_attempts {
        crate::escalate::escalate_to_hitl(
            &shared,
            n,
            &shared.config.ready_label.clone(),
            "attempt cap exceeded",
            None,
        )
        .await;
        shared.issue_store.mark_complete(n).await;
        return;
    }

    let branch = issue.branch_name();
    let worktree_path = match shared.worktree.create(n, &branch).await {
        Ok(path) => path,
        Err(e) => {
            shared.publish_error("implement", &format!("worktree create failed for #{n}: {e}"));
            shared.issue_store.mark_complete(n).await;
            return;
        }
    };

    let (review_feedback, is_retry) = {
        let mut state = shared.state.lock().await;
        state.set_worktree(n, worktree_path.display().to_string());
        state.set_branch(n, branch.clone());
        let feedback = state.get_review_feedback(n).map(|s| s.to_string());
        if feedback.is_some() {
            state.clear_review_feedback(n);
        }
        let is_retry = feedback.is_some();
        (feedback, is_retry)
    };

    let mut ctx = PhaseContext::new(
        issue.clone(),
        branch.clone(),
        shared.config.model.clone(),
        shared.config.max_budget_usd,
    );
    ctx.worktree_path = Some(worktree_path.clone());
    ctx.review_feedback = review_feedback;

    let result = runner
        .run(
            shared.executor.as_ref(),
            Some(&shared.bus),
            &shared.live,
            &shared.stream_config,
            &ctx,
            &shared.config.quality_gate_command,
            &shared.config.main_branch,
            shared.config.max_quality_fix_attempts,
        )
        .await;

    match result {
        Ok(worker_result) => handle_result(&shared, &issue, &branch, worktree_path, worker_result, is_retry).await,
        Err(PhaseError::Authentication(msg)) => shared.trigger_fatal(&msg),
        Err(PhaseError::CreditExhausted(msg)) => shared.trigger_fatal(&msg),
        Err(e) => shared.publish_error("implement", &e.to_string()),
    }

    shared.issue_store.mark_complete(n).await;
}

async fn handle_result(
    shared: &Arc<Shared>,
    issue: &Issue,
    branch: &str,
    worktree_path: PathBuf,
    result: hydra_core::WorkerResult,
    is_retry: bool,
) {
    let n = issue.number;
    {
        let mut state = shared.state.lock().await;
        state.record_implementation_duration(result.duration_seconds);
        if result.quality_fix_attempts > 0 {
            state.record_quality_fix_rounds(result.quality_fix_attempts as u64);
        }
    }

    if result.is_zero_commit_already_satisfied() {
        let _ = shared
            .github
            .swap_labels(n, &[shared.config.ready_label.clone()], &[shared.config.dup_label.clone()])
            .await;
        let _ = shared
            .github
            .post_comment(
                n,
                &format!(
                    "No changes were necessary to resolve this issue; it already appears to be \
                     satisfied on `{}`. Closing as a duplicate.\n\n{ESCALATION_MARKER}",
                    shared.config.main_branch
                ),
            )
            .await;
        let _ = shared.github.close_issue(n).await;
        let mut state = shared.state.lock().await;
        state.mark_issue(n, "already_satisfied");
        state.reset_issue_attempts(n);
        return;
    }

    // Push whatever commits exist — including a quality-fix retry's fixes
    // on a REQUEST_CHANGES re-entry — before deciding what happens to the
    // PR. Without this, a retry that swaps straight to the review label
    // below would leave the remote branch (and hence the PR the review
    // loop diffs and merges) without the new commits.
    if let Err(e) = shared.worktree.push_branch(&worktree_path, branch).await {
        shared.publish_error("implement", &format!("failed to push branch for #{n}: {e}"));
        return;
    }

    if !result.success {
        let detail = result.error.clone().unwrap_or_default();
        {
            let mut state = shared.state.lock().await;
            state.set_review_feedback(
                n,
                format!("Implementation still fails the quality gate after retries:\n\n{detail}"),
            );
        }
        shared.publish_error("implement", &format!("issue #{n} failed its quality gate"));

        // First attempt: open a draft PR so the failing state is visible
        // for human/reviewer follow-up. A retry already has one.
        if !is_retry {
            open_pull_request(shared, issue, branch, true).await;
        }
        return;
    }

    if is_retry {
        let _ = shared
            .github
            .swap_labels(n, &[shared.config.ready_label.clone()], &[shared.config.review_label.clone()])
            .await;
        shared.issue_store.set_stage(n, LifecycleStage::Review).await;
        let mut state = shared.state.lock().await;
        state.mark_issue(n, "implemented");
        state.reset_issue_attempts(n);
        return;
    }

    open_pull_request(shared, issue, branch, false).await;
}

/// Opens the PR for a first (non-retry) implementation attempt, draft iff
/// the quality gate failed. A draft PR only records the PR number for
/// later reuse — the issue stays on `ready_label` so the implement loop
/// picks it back up; a non-draft PR swaps to `review_label` and hands the
/// issue to the review loop.
async fn open_pull_request(shared: &Arc<Shared>, issue: &Issue, branch: &str, draft: bool) {
    let n = issue.number;
    let title = format!("Fix #{n}: {}", issue.title);
    let body = format!("Implements #{n}.\n\nCloses #{n}.");
    match shared
        .github
        .create_pr(&title, &body, branch, &shared.config.main_branch, draft)
        .await
    {
        Ok(pr) => {
            let mut state = shared.state.lock().await;
            if !draft {
                drop(state);
                let _ = shared
                    .github
                    .swap_labels(n, &[shared.config.ready_label.clone()], &[shared.config.review_label.clone()])
                    .await;
                shared.issue_store.set_stage(n, LifecycleStage::Review).await;
                state = shared.state.lock().await;
                state.mark_issue(n, "implemented");
                state.reset_issue_attempts(n);
            }
            state.set_worker_result_meta(n, serde_json::json!({ "pr_number": pr.number }));
        }
        Err(e) => {
            warn!(issue = n, error = %e, "failed to open pull request");
            shared.publish_error("implement", &format!("failed to open PR for #{n}: {e}"));
        }
    }
}
