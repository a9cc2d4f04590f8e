//! Merge-conflict resolver: invoked when `WorktreeManager::start_merge_main`
//! leaves a worktree with unresolved conflict markers instead of aborting.
//! One agent invocation, full tool access, followed by a check that the
//! merge was actually completed — mirrors `review_phase.py`'s
//! `_resolve_merge_conflicts`.

use std::path::Path;

use async_trait::async_trait;

use hydra_executor::executor::Executor;

use crate::context::PhaseContext;
use crate::runner::{run_phase, PhaseError, PhaseRunner};
use hydra_bus::EventBus;
use hydra_executor::stream_reader::{LiveProcessSet, StreamReaderConfig};

pub struct ConflictResolverRunner {
    main_commits: String,
}

impl ConflictResolverRunner {
    pub fn new(main_commits: impl Into<String>) -> Self {
        Self {
            main_commits: main_commits.into(),
        }
    }

    /// Runs the agent against the in-progress conflicted merge, then
    /// reports whether it left no unmerged paths behind — i.e. whether it
    /// actually completed the merge commit rather than just editing files.
    pub async fn resolve(
        &self,
        executor: &dyn Executor,
        bus: Option<&EventBus>,
        live: &LiveProcessSet,
        stream_config: &StreamReaderConfig,
        ctx: &PhaseContext,
    ) -> Result<bool, PhaseError> {
        let worktree_path = ctx
            .worktree_path
            .clone()
            .expect("conflict resolution requires a worktree");

        run_phase(self, executor, ctx, bus, live, stream_config).await?;
        Ok(!has_unmerged_paths(&worktree_path).await)
    }
}

#[async_trait]
impl PhaseRunner for ConflictResolverRunner {
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
        let commits = if self.main_commits.trim().is_empty() {
            "(no recent commits found on main)".to_string()
        } else {
            self.main_commits.clone()
        };
        format!(
            "Merging the latest main branch into this branch for issue #{} left unresolved \
             conflicts.\n\n\
             ## Recent commits on main since this branch diverged\n\n{commits}\n\n\
             Run `git status` to see the conflicted files. Resolve every conflict marker in \
             favor of correct, working code, keeping this branch's intent for the files issue \
             #{} touches. Then run `git add -A && git commit --no-edit` to complete the merge.\n",
            ctx.issue.number, ctx.issue.number
        )
    }

    fn parse_result(&self, transcript: &str, _ctx: &PhaseContext) -> Self::Output {
        transcript.to_string()
    }
}

async fn has_unmerged_paths(worktree_path: &Path) -> bool {
    match tokio::process::Command::new("git")
        .args(["diff", "--name-only", "--diff-filter=U"])
        .current_dir(worktree_path)
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            !String::from_utf8_lossy(&output.stdout).trim().is_empty()
        }
        _ => true,
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
                number: 12,
                title: "t".into(),
                body: "b".into(),
                labels: BTreeSet::new(),
                comments: vec![],
                url: String::new(),
            },
            "agent/issue-12".into(),
            "sonnet".into(),
            0.0,
        )
    }

    #[test]
    fn prompt_includes_issue_number_and_main_commits() {
        let runner = ConflictResolverRunner::new("abc123 fix typo");
        let prompt = runner.build_prompt(&ctx());
        assert!(prompt.contains("#12"));
        assert!(prompt.contains("abc123 fix typo"));
    }

    #[test]
    fn prompt_has_a_placeholder_when_main_commits_is_empty() {
        let runner = ConflictResolverRunner::new("");
        let prompt = runner.build_prompt(&ctx());
        assert!(prompt.contains("no recent commits"));
    }

    #[tokio::test]
    async fn has_unmerged_paths_is_conservatively_true_without_a_git_repo() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(has_unmerged_paths(tmp.path()).await);
    }
}
