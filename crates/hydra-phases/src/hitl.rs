//! HITL runner: applies a human-supplied correction to an escalated issue.
//! One agent invocation carrying the correction text, verified once against
//! the quality gate — no quality-fix retry loop, since a human is already
//! involved in judging the result.

use std::time::Instant;

use async_trait::async_trait;

use hydra_core::WorkerResult;
use hydra_executor::executor::Executor;

use crate::context::PhaseContext;
use crate::implementer::{count_commits, run_quality_gate};
use crate::runner::{run_phase, PhaseError, PhaseRunner};
use hydra_bus::EventBus;
use hydra_executor::stream_reader::{LiveProcessSet, StreamReaderConfig};

pub struct HitlRunner {
    correction: String,
}

impl HitlRunner {
    pub fn new(correction: impl Into<String>) -> Self {
        Self {
            correction: correction.into(),
        }
    }

    pub async fn run(
        &self,
        executor: &dyn Executor,
        bus: Option<&EventBus>,
        live: &LiveProcessSet,
        stream_config: &StreamReaderConfig,
        ctx: &PhaseContext,
        quality_gate_command: &[String],
        main_branch: &str,
    ) -> Result<WorkerResult, PhaseError> {
        let start = Instant::now();
        let worktree_path = ctx
            .worktree_path
            .clone()
            .expect("hitl correction requires a worktree");

        let transcript = run_phase(self, executor, ctx, bus, live, stream_config).await?;
        let (success, error_output) = run_quality_gate(&worktree_path, quality_gate_command).await;
        let commits = count_commits(&worktree_path, main_branch, &ctx.branch).await;

        Ok(WorkerResult {
            issue_number: ctx.issue.number,
            branch: ctx.branch.clone(),
            success,
            transcript,
            commits,
            worktree_path: Some(worktree_path.display().to_string()),
            duration_seconds: start.elapsed().as_secs_f64(),
            error: if success { None } else { Some(error_output) },
            quality_fix_attempts: 0,
            pr_info: None,
        })
    }
}

#[async_trait]
impl PhaseRunner for HitlRunner {
    type Output = String;

    fn build_argv(&self, ctx: &PhaseContext) -> Vec<String> {
        let mut argv = vec![
            "claude".to_string(),
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--model".to_string(),
            ctx.model.clone(),
            "--verbose".to_string(),
            "--permission-mode".to_string(),
            "bypassPermissions".to_string(),
        ];
        if ctx.max_budget_usd > 0.0 {
            argv.push("--max-budget-usd".to_string());
            argv.push(ctx.max_budget_usd.to_string());
        }
        argv
    }

    fn build_prompt(&self, ctx: &PhaseContext) -> String {
        format!(
            "Apply a human correction to issue #{}: {}\n\n{}\n\n\
             ## Human Correction\n\n{}\n\n\
             Make the requested change and commit it.\n",
            ctx.issue.number, ctx.issue.title, ctx.issue.body, self.correction
        )
    }

    fn parse_result(&self, transcript: &str, _ctx: &PhaseContext) -> Self::Output {
        transcript.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_core::Issue;
    use std::collections::BTreeSet;

    fn ctx() -> PhaseContext {
        PhaseContext::new(
            Issue {
                number: 9,
                title: "t".into(),
                body: "b".into(),
                labels: BTreeSet::new(),
                comments: vec![],
                url: String::new(),
            },
            "agent/issue-9".into(),
            "sonnet".into(),
            0.0,
        )
    }

    #[test]
    fn prompt_includes_issue_and_correction_text() {
        let runner = HitlRunner::new("Please update the validation logic");
        let prompt = runner.build_prompt(&ctx());
        assert!(prompt.contains("#9"));
        assert!(prompt.contains("Please update the validation logic"));
        assert!(prompt.contains("Human Correction"));
    }

    #[test]
    fn argv_omits_budget_when_zero() {
        let runner = HitlRunner::new("fix it");
        let argv = runner.build_argv(&ctx());
        assert!(!argv.contains(&"--max-budget-usd".to_string()));
    }
}
