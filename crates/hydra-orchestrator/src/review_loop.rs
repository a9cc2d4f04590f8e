//! Review loop: merges main into the PR branch, asks the agent to review
//! (and, if it chooses, fix) the diff, then either sends the issue back to
//! implement (REQUEST_CHANGES), waits out CI and merges (APPROVE), or
//! leaves a comment (COMMENT) for a later pass.

use std::sync::Arc;
use std::time::Duration;

use hydra_core::{Issue, LifecycleStage, PrInfo, ReviewResult, ReviewVerdict};
use hydra_phases::{CiOutcome, CiWaitConfig, ConflictResolverRunner, PhaseContext, PhaseError, ReviewerRunner};
use hydra_github::{EpicCompletionChecker, PullRequestSummary};
use tracing::info;

use crate::shared::Shared;

pub async fn run(shared: Arc<Shared>, once: bool) {
    let runner = Arc::new(ReviewerRunner::new());
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

async fn tick(shared: &Arc<Shared>, runner: &Arc<ReviewerRunner>) {
    let max = 2 * shared.config.max_reviewers;
    let issues = shared.issue_store.get_reviewable(max).await;
    if issues.is_empty() {
        return;
    }

    let shared2 = shared.clone();
    let runner2 = runner.clone();
    crate::batch::run_batch(
        issues,
        shared.config.max_reviewers,
        &shared.shutdown,
        &shared.active_handles,
        move |issue: Issue| {
            let shared = shared2.clone();
            let runner = runner2.clone();
            async move { review_one(shared, runner, issue).await }
        },
    )
    .await;
}

async fn review_one(shared: Arc<Shared>, runner: Arc<ReviewerRunner>, issue: Issue) {
    let n = issue.number;
    shared.issue_store.mark_active(n, LifecycleStage::Review).await;

    let pr_number = {
        let state = shared.state.lock().await;
        state.get_worker_result_meta(n).get("pr_number").and_then(|v| v.as_u64())
    };
    let Some(pr_number) = pr_number else {
        shared.publish_error("review", &format!("issue #{n} has no recorded pull request"));
        shared.issue_store.mark_complete(n).await;
        return;
    };

    let pr_summary = match shared.github.get_pr(pr_number).await {
        Ok(pr) => pr,
        Err(e) => {
            shared.publish_error("review", &format!("could not fetch PR #{pr_number}: {e}"));
            shared.issue_store.mark_complete(n).await;
            return;
        }
    };
    let pr = to_pr_info(&pr_summary, n);

    let worktree_path = shared.worktree.path_for(n);
    match shared.worktree.start_merge_main(&worktree_path).await {
        Ok(true) => {}
        Ok(false) => {
            // Leave an agent to resolve the conflict before giving up on it.
            let resolved = resolve_merge_conflict(&shared, &issue, &pr, &worktree_path).await;
            if shared.is_fatal() {
                shared.issue_store.mark_complete(n).await;
                return;
            }
            if !resolved {
                let _ = shared.worktree.abort_merge(&worktree_path).await;
                crate::escalate::escalate_to_hitl(
                    &shared,
                    n,
                    &shared.config.review_label.clone(),
                    "Merge conflict with main branch",
                    None,
                )
                .await;
                shared.issue_store.mark_complete(n).await;
                return;
            }
        }
        Err(e) => {
            shared.publish_error("review", &format!("merge-main failed for #{n}: {e}"));
            shared.issue_store.mark_complete(n).await;
            return;
        }
    }

    let diff = match shared.github.diff(pr_number).await {
        Ok(d) => d,
        Err(e) => {
            shared.publish_error("review", &format!("could not fetch diff for PR #{pr_number}: {e}"));
            shared.issue_store.mark_complete(n).await;
            return;
        }
    };

    let mut ctx = PhaseContext::new(
        issue.clone(),
        pr.branch.clone(),
        shared.config.review_model.clone(),
        shared.config.review_budget_usd,
    );
    ctx.worktree_path = Some(worktree_path.clone());

    let ci_fix_enabled = shared.config.max_ci_fix_attempts > 0;
    let review_result = runner
        .review(
            shared.executor.as_ref(),
            Some(&shared.bus),
            &shared.live,
            &shared.stream_config,
            &ctx,
            &pr,
            &diff,
            ci_fix_enabled,
        )
        .await;

    let mut result = match review_result {
        Ok(r) => r,
        Err(PhaseError::Authentication(msg)) => {
            shared.trigger_fatal(&msg);
            shared.issue_store.mark_complete(n).await;
            return;
        }
        Err(PhaseError::CreditExhausted(msg)) => {
            shared.trigger_fatal(&msg);
            shared.issue_store.mark_complete(n).await;
            return;
        }
        Err(e) => {
            shared.publish_error("review", &e.to_string());
            shared.issue_store.mark_complete(n).await;
            return;
        }
    };

    if result.fixes_made {
        if let Err(e) = shared.worktree.push_branch(&worktree_path, &pr.branch).await {
            shared.publish_error("review", &format!("failed to push reviewer fixes for PR #{pr_number}: {e}"));
        }
    }

    {
        let mut state = shared.state.lock().await;
        state.record_review_duration(result.duration_seconds);
        state.record_review_verdict(result.verdict.as_state_str(), result.fixes_made);
    }

    match result.verdict {
        ReviewVerdict::RequestChanges => request_changes(&shared, n, &result).await,
        ReviewVerdict::Approve => approve(&shared, &runner, &issue, &pr, &ctx, ci_fix_enabled, &mut result).await,
        ReviewVerdict::Comment => {
            let _ = shared.github.post_comment(n, &format!("Review: {}", result.summary)).await;
        }
    }

    shared.issue_store.mark_complete(n).await;
}

/// Runs a conflict-resolution agent against a worktree `start_merge_main`
/// left with unresolved conflict markers. Returns whether it finished the
/// merge cleanly (no unmerged paths left).
async fn resolve_merge_conflict(
    shared: &Arc<Shared>,
    issue: &Issue,
    pr: &PrInfo,
    worktree_path: &std::path::Path,
) -> bool {
    let main_commits = shared.worktree.get_main_commits_since_diverge(worktree_path).await;

    let mut ctx = PhaseContext::new(
        issue.clone(),
        pr.branch.clone(),
        shared.config.review_model.clone(),
        shared.config.review_budget_usd,
    );
    ctx.worktree_path = Some(worktree_path.to_path_buf());

    let runner = ConflictResolverRunner::new(main_commits);
    match runner
        .resolve(shared.executor.as_ref(), Some(&shared.bus), &shared.live, &shared.stream_config, &ctx)
        .await
    {
        Ok(resolved) => resolved,
        Err(PhaseError::Authentication(msg)) => {
            shared.trigger_fatal(&msg);
            false
        }
        Err(PhaseError::CreditExhausted(msg)) => {
            shared.trigger_fatal(&msg);
            false
        }
        Err(e) => {
            shared.publish_error(
                "review",
                &format!("conflict resolution agent failed for #{}: {e}", issue.number),
            );
            false
        }
    }
}

async fn request_changes(shared: &Arc<Shared>, issue_number: u64, result: &ReviewResult) {
    {
        let mut state = shared.state.lock().await;
        state.set_review_feedback(issue_number, result.summary.clone());
        state.increment_review_attempts(issue_number);
    }
    let _ = shared
        .github
        .swap_labels(
            issue_number,
            &[shared.config.review_label.clone()],
            &[shared.config.ready_label.clone()],
        )
        .await;
    shared.issue_store.set_stage(issue_number, LifecycleStage::Implement).await;
}

async fn approve(
    shared: &Arc<Shared>,
    runner: &Arc<ReviewerRunner>,
    issue: &Issue,
    pr: &PrInfo,
    ctx: &PhaseContext,
    ci_fix_enabled: bool,
    result: &mut ReviewResult,
) {
    if !ci_fix_enabled {
        finalize_merge(shared, issue, pr, result).await;
        return;
    }

    let ci_config = CiWaitConfig {
        timeout_secs: shared.config.ci_check_timeout,
        poll_interval_secs: shared.config.ci_poll_interval,
        max_fix_attempts: shared.config.max_ci_fix_attempts,
    };

    let outcome = hydra_phases::wait_and_fix_ci(
        runner,
        shared.executor.as_ref(),
        Some(&shared.bus),
        &shared.live,
        &shared.stream_config,
        ctx,
        &shared.github,
        &shared.worktree,
        pr,
        &ci_config,
        &shared.shutdown,
        result,
    )
    .await;

    {
        let mut state = shared.state.lock().await;
        if result.ci_fix_attempts > 0 {
            state.record_ci_fix_rounds(result.ci_fix_attempts as u64);
        }
    }

    match outcome {
        Ok(CiOutcome::Approved) => finalize_merge(shared, issue, pr, result).await,
        Ok(CiOutcome::Escalated { summary }) => {
            crate::escalate::escalate_to_hitl(
                shared,
                issue.number,
                &shared.config.review_label.clone(),
                &format!("CI failed after {} fix attempt(s)", result.ci_fix_attempts),
                Some(&summary),
            )
            .await;
        }
        Err(PhaseError::Authentication(msg)) => shared.trigger_fatal(&msg),
        Err(PhaseError::CreditExhausted(msg)) => shared.trigger_fatal(&msg),
        Err(e) => shared.publish_error("review", &e.to_string()),
    }
}

async fn finalize_merge(shared: &Arc<Shared>, issue: &Issue, pr: &PrInfo, result: &mut ReviewResult) {
    let n = issue.number;
    if let Err(e) = shared
        .github
        .merge_pr(pr.number, Some(&format!("Merge PR #{}: {}", pr.number, issue.title)))
        .await
    {
        shared.publish_error("review", &format!("failed to merge PR #{}: {e}", pr.number));
        return;
    }
    result.merged = true;

    let _ = shared
        .github
        .swap_labels(n, &[shared.config.review_label.clone()], &[shared.config.fixed_label.clone()])
        .await;
    let _ = shared.worktree.destroy(n).await;

    {
        let mut state = shared.state.lock().await;
        state.mark_issue(n, "success");
        state.record_issue_completed();
        state.record_pr_merged();
        state.remove_worktree(n);
        state.reset_review_attempts(n);
        state.reset_issue_attempts(n);
        state.clear_review_feedback(n);
    }
    shared.issue_store.remove(n).await;

    let checker = EpicCompletionChecker::new(&shared.github, shared.config.epic_label.clone(), shared.config.fixed_label.clone());
    match checker.check_and_close_epics(n).await {
        Ok(closed) if !closed.is_empty() => info!(issues = ?closed, "closed epics with all sub-issues fixed"),
        Ok(_) => {}
        Err(e) => shared.publish_error("review", &format!("epic auto-close failed: {e}")),
    }
}

fn to_pr_info(summary: &PullRequestSummary, issue_number: u64) -> PrInfo {
    PrInfo {
        number: summary.number,
        issue_number,
        branch: summary.branch.clone(),
        url: summary.url.clone(),
        draft: summary.draft,
    }
}
