//! HITL loop: watches `hitl_label` issues for a fresh human reply (one that
//! doesn't carry our own escalation marker) and applies it as a correction.
//!
//! `IssueStore` has no dedicated HITL-stage query analogous to the other
//! four phases, since the label only ever gets attached by this
//! orchestrator's own escalation path rather than by an external triager —
//! so this loop reads straight from GitHub instead of the cached store.

use std::sync::Arc;
use std::time::Duration;

use hydra_core::{Issue, LifecycleStage};
use hydra_phases::{HitlRunner, PhaseContext, PhaseError};

use crate::shared::{Shared, ESCALATION_MARKER};

pub async fn run(shared: Arc<Shared>, once: bool) {
    let mut ticker = tokio::time::interval(Duration::from_secs(shared.config.poll_interval_secs));
    let mut stop_rx = shared.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                if shared.shutdown.is_shutting_down() {
                    break;
                }
                tick(&shared).await;
                if once {
                    break;
                }
            }
        }
    }
}

async fn tick(shared: &Arc<Shared>) {
    let issues = match shared
        .github
        .list_issues_with_labels(&[shared.config.hitl_label.clone()])
        .await
    {
        Ok(issues) => issues,
        Err(e) => {
            shared.publish_error("hitl", &format!("could not list HITL issues: {e}"));
            return;
        }
    };

    // `list_issues_with_labels` doesn't hydrate comments (they're not part
    // of the issue-listing API response) — fetch them per issue so
    // `has_new_correction` can actually see what a human last wrote.
    let mut hydrated = Vec::with_capacity(issues.len());
    for mut issue in issues {
        match shared.github.list_comments(issue.number).await {
            Ok(comments) => issue.comments = comments,
            Err(e) => {
                shared.publish_error("hitl", &format!("could not list comments for #{}: {e}", issue.number));
                continue;
            }
        }
        hydrated.push(issue);
    }

    let max = 2 * shared.config.max_hitl_workers;
    let candidates: Vec<Issue> = hydrated
        .into_iter()
        .filter(|issue| has_new_correction(issue))
        .take(max)
        .collect();
    if candidates.is_empty() {
        return;
    }

    let shared2 = shared.clone();
    crate::batch::run_batch(
        candidates,
        shared.config.max_hitl_workers,
        &shared.shutdown,
        &shared.active_handles,
        move |issue: Issue| {
            let shared = shared2.clone();
            async move { hitl_one(shared, issue).await }
        },
    )
    .await;
}

fn has_new_correction(issue: &Issue) -> bool {
    issue
        .comments
        .last()
        .map(|c| !c.contains(ESCALATION_MARKER))
        .unwrap_or(false)
}

async fn hitl_one(shared: Arc<Shared>, issue: Issue) {
    let n = issue.number;
    if shared.issue_store.is_active(n).await {
        return;
    }
    shared.issue_store.mark_active(n, LifecycleStage::Hitl).await;

    let correction = issue.comments.last().cloned().unwrap_or_default();
    let branch = {
        let state = shared.state.lock().await;
        state.get_branch(n).map(|s| s.to_string()).unwrap_or_else(|| issue.branch_name())
    };

    let worktree_path = match shared.worktree.create(n, &branch).await {
        Ok(path) => path,
        Err(e) => {
            shared.publish_error("hitl", &format!("worktree create failed for #{n}: {e}"));
            shared.issue_store.mark_complete(n).await;
            return;
        }
    };

    let mut ctx = PhaseContext::new(
        issue.clone(),
        branch.clone(),
        shared.config.model.clone(),
        shared.config.max_budget_usd,
    );
    ctx.worktree_path = Some(worktree_path.clone());

    let runner = HitlRunner::new(correction);
    let result = runner
        .run(
            shared.executor.as_ref(),
            Some(&shared.bus),
            &shared.live,
            &shared.stream_config,
            &ctx,
            &shared.config.quality_gate_command,
            &shared.config.main_branch,
        )
        .await;

    match result {
        Ok(worker_result) if worker_result.success => {
            if let Err(e) = shared.worktree.push_branch(&worktree_path, &branch).await {
                shared.publish_error("hitl", &format!("failed to push corrected branch for #{n}: {e}"));
            }

            let origin = {
                let mut state = shared.state.lock().await;
                let origin = state
                    .get_hitl_origin(n)
                    .unwrap_or(&shared.config.ready_label)
                    .to_string();
                state.remove_hitl_origin(n);
                state.remove_hitl_cause(n);
                origin
            };

            let _ = shared
                .github
                .swap_labels(n, &[shared.config.hitl_label.clone()], &[origin.clone()])
                .await;
            shared.issue_store.set_stage(n, stage_for_label(&shared, &origin)).await;
        }
        Ok(worker_result) => {
            let detail = worker_result.error.unwrap_or_default();
            let _ = shared
                .github
                .post_comment(
                    n,
                    &format!(
                        "The correction attempt still fails the quality gate:\n\n```\n{detail}\n```\n\n\
                         Please reply with another correction.\n\n{ESCALATION_MARKER}"
                    ),
                )
                .await;
        }
        Err(PhaseError::Authentication(msg)) => shared.trigger_fatal(&msg),
        Err(PhaseError::CreditExhausted(msg)) => shared.trigger_fatal(&msg),
        Err(e) => shared.publish_error("hitl", &e.to_string()),
    }

    shared.issue_store.mark_complete(n).await;
}

fn stage_for_label(shared: &Shared, label: &str) -> LifecycleStage {
    if label == shared.config.review_label {
        LifecycleStage::Review
    } else if label == shared.config.plan_label {
        LifecycleStage::Plan
    } else {
        LifecycleStage::Implement
    }
}
