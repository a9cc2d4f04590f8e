//! Shared HITL escalation path: used whenever the implement or review loop
//! gives up on an issue (attempt cap exceeded, merge conflict, CI never
//! green) and hands it to a human instead.

use std::sync::Arc;

use hydra_core::events::HitlUpdateEvent;
use hydra_core::HydraEvent;

use crate::shared::{Shared, ESCALATION_MARKER};

pub async fn escalate_to_hitl(
    shared: &Arc<Shared>,
    issue_number: u64,
    origin_label: &str,
    cause: &str,
    detail: Option<&str>,
) {
    {
        let mut state = shared.state.lock().await;
        state.set_hitl_origin(issue_number, origin_label);
        state.set_hitl_cause(issue_number, cause);
        state.record_hitl_escalation();
    }

    let _ = shared
        .github
        .swap_labels(
            issue_number,
            &[origin_label.to_string()],
            &[shared.config.hitl_label.clone()],
        )
        .await;

    let mut body = format!("Escalating to human review: {cause}.");
    if let Some(detail) = detail {
        body.push_str(&format!("\n\n```\n{detail}\n```"));
    }
    body.push_str(&format!(
        "\n\nReply with a correction and this issue will be picked back up automatically.\n\n{ESCALATION_MARKER}"
    ));
    let _ = shared.github.post_comment(issue_number, &body).await;

    shared.publish(HydraEvent::HitlUpdate(HitlUpdateEvent {
        issue_number,
        cause: cause.to_string(),
    }));
}
