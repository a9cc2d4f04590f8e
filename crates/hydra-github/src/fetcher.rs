//! Bridges the label-based GitHub view onto `hydra_store::IssueFetcher`,
//! mapping each `LifecycleStage` to the label that marks an issue ready for
//! that stage.

use async_trait::async_trait;
use hydra_core::{Issue, LifecycleStage};
use hydra_store::IssueFetcher;

use crate::client::GitHubClient;

/// The five labels that gate entry into each lifecycle stage, resolved once
/// from `HydraConfig` at startup.
#[derive(Debug, Clone)]
pub struct StageLabels {
    pub triage: String,
    pub plan: String,
    pub implement: String,
    pub review: String,
    pub hitl: String,
}

impl StageLabels {
    fn label_for(&self, stage: LifecycleStage) -> &str {
        match stage {
            LifecycleStage::Triage => &self.triage,
            LifecycleStage::Plan => &self.plan,
            LifecycleStage::Implement => &self.implement,
            LifecycleStage::Review => &self.review,
            LifecycleStage::Hitl => &self.hitl,
        }
    }
}

pub struct GitHubIssueFetcher {
    client: GitHubClient,
    labels: StageLabels,
}

impl GitHubIssueFetcher {
    pub fn new(client: GitHubClient, labels: StageLabels) -> Self {
        Self { client, labels }
    }
}

#[async_trait]
impl IssueFetcher for GitHubIssueFetcher {
    async fn fetch_for_stage(&self, stage: LifecycleStage) -> anyhow::Result<Vec<Issue>> {
        let label = self.labels.label_for(stage).to_string();
        Ok(self.client.list_issues_with_labels(&[label]).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> StageLabels {
        StageLabels {
            triage: "hydra-find".into(),
            plan: "hydra-plan".into(),
            implement: "hydra-ready".into(),
            review: "hydra-review".into(),
            hitl: "hydra-hitl".into(),
        }
    }

    #[test]
    fn stage_maps_to_expected_label() {
        let l = labels();
        assert_eq!(l.label_for(LifecycleStage::Implement), "hydra-ready");
        assert_eq!(l.label_for(LifecycleStage::Hitl), "hydra-hitl");
    }
}
