//! Triage loop: asks the agent whether a `find_label` issue is ready to
//! plan, and moves it to `plan_label` or leaves it for a later pass.

use std::sync::Arc;
use std::time::Duration;

use hydra_core::events::TriageUpdateEvent;
use hydra_core::{HydraEvent, Issue, LifecycleStage};
use hydra_phases::{run_phase, PhaseError, PhaseContext, TriageOutcome, TriageRunner};
use tracing::info;

use crate::shared::Shared;

/// Tools triage is never allowed to reach for: it only judges readiness,
/// it never edits the repository.
const DENYLISTED_TOOLS: &[&str] = &["Write", "Edit", "NotebookEdit", "Bash"];

pub async fn run(shared: Arc<Shared>, once: bool) {
    let runner = Arc::new(TriageRunner::new(
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

async fn tick(shared: &Arc<Shared>, runner: &Arc<TriageRunner>) {
    let max = 2 * shared.config.max_workers;
    let issues = shared.issue_store.get_triageable(max).await;
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
            async move { triage_one(shared, runner, issue).await }
        },
    )
    .await;
}

async fn triage_one(shared: Arc<Shared>, runner: Arc<TriageRunner>, issue: Issue) {
    let n = issue.number;
    shared.issue_store.mark_active(n, LifecycleStage::Triage).await;

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
        Ok(TriageOutcome { ready, rationale, .. }) => {
            shared.publish(HydraEvent::TriageUpdate(TriageUpdateEvent {
                issue_number: n,
                ready,
            }));
            if ready {
                let _ = shared
                    .github
                    .swap_labels(n, &[shared.config.find_label.clone()], &[shared.config.plan_label.clone()])
                    .await;
                shared.issue_store.set_stage(n, LifecycleStage::Plan).await;
            } else {
                info!(issue = n, rationale, "issue deferred at triage");
            }
        }
        Err(PhaseError::Authentication(msg)) => shared.trigger_fatal(&msg),
        Err(PhaseError::CreditExhausted(msg)) => shared.trigger_fatal(&msg),
        Err(e) => shared.publish_error("triage", &e.to_string()),
    }

    shared.issue_store.mark_complete(n).await;
}
