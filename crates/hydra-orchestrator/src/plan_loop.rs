//! Plan loop: asks the agent to sketch an implementation plan for a
//! `plan_label` issue, posts it as a comment, and promotes the issue to
//! `ready_label` for the implement loop to pick up.

use std::sync::Arc;
use std::time::Duration;

use hydra_core::{Issue, LifecycleStage};
use hydra_phases::{run_phase, PhaseError, PhaseContext, PlanOutput, PlannerRunner};

use crate::shared::Shared;

/// Planning never touches the repository either; it only reads and reasons.
const DENYLISTED_TOOLS: &[&str] = &["Write", "Edit", "NotebookEdit", "Bash"];

pub async fn run(shared: Arc<Shared>, once: bool) {
    let runner = Arc::new(PlannerRunner::new(
        DENYLISTED_TOOLS.iter().map(|s| s.to_string()).collect(),
    ));
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

async fn tick(shared: &Arc<Shared>, runner: &Arc<PlannerRunner>) {
    let max = 2 * shared.config.max_planners;
    let issues = shared.issue_store.get_plannable(max).await;
    if issues.is_empty() {
        return;
    }

    let shared2 = shared.clone();
    let runner2 = runner.clone();
    crate::batch::run_batch(
        issues,
        shared.config.max_planners,
        &shared.shutdown,
        &shared.active_handles,
        move |issue: Issue| {
            let shared = shared2.clone();
            let runner = runner2.clone();
            async move { plan_one(shared, runner, issue).await }
        },
    )
    .await;
}

async fn plan_one(shared: Arc<Shared>, runner: Arc<PlannerRunner>, issue: Issue) {
    let n = issue.number;
    shared.issue_store.mark_active(n, LifecycleStage::Plan).await;

    let ctx = PhaseContext::new(
        issue.clone(),
        issue.branch_name(),
        shared.config.model.clone(),
        shared.config.max_budget_usd,
    );

    let result = run_phase(
        runner.as_ref(),
        shared.executor.as_ref(),
        &ctx,
        Some(&shared.bus),
        &shared.live,
        &shared.stream_config,
    )
    .await;

    match result {
        Ok(PlanOutput { plan_text, .. }) => {
            let _ = shared
                .github
                .post_comment(n, &format!("## Implementation Plan\n\n{plan_text}"))
                .await;
            let _ = shared
                .github
                .swap_labels(n, &[shared.config.plan_label.clone()], &[shared.config.ready_label.clone()])
                .await;
            shared.issue_store.set_stage(n, LifecycleStage::Implement).await;
        }
        Err(PhaseError::Authentication(msg)) => shared.trigger_fatal(&msg),
        Err(PhaseError::CreditExhausted(msg)) => shared.trigger_fatal(&msg),
        Err(e) => shared.publish_error("plan", &e.to_string()),
    }

    shared.issue_store.mark_complete(n).await;
}
