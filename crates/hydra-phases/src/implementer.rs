//! Implementer runner: invokes the agent once, verifies with the project
//! quality gate, and retries via a focused quality-fix loop on failure.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;

use hydra_core::WorkerResult;
use hydra_executor::executor::Executor;

use crate::context::PhaseContext;
use crate::runner::{run_phase, PhaseError, PhaseRunner};
use crate::sentinels::tail_chars;
use hydra_bus::EventBus;
use hydra_executor::stream_reader::{LiveProcessSet, StreamReaderConfig};

const QUALITY_OUTPUT_TAIL: usize = 3000;

pub struct ImplementerRunner;

/// One agent invocation. Used both for the initial run and for each
/// quality-fix retry — only the prompt differs.
struct ImplementStep<'a> {
    extra_context: Option<&'a str>,
}

#[async_trait]
impl PhaseRunner for ImplementStep<'_> {
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
        let mut prompt = format!(
            "Implement issue #{}: {}\n\n{}\n",
            ctx.issue.number, ctx.issue.title, ctx.issue.body
        );
        if let Some(feedback) = &ctx.review_feedback {
            prompt.push_str(&format!(
                "\n## Reviewer feedback from a prior attempt\n\n{feedback}\n"
            ));
        }
        if let Some(extra) = self.extra_context {
            prompt.push_str(&format!(
                "\n## Quality Gate Failure Output\n\n```\n{}\n```\n\n\
                 Fix ALL lint, type-check, security, and test issues. Do not skip or \
                 disable checks. Commit your fixes.\n",
                tail_chars(extra, QUALITY_OUTPUT_TAIL)
            ));
        }
        prompt
    }

    fn parse_result(&self, transcript: &str, _ctx: &PhaseContext) -> Self::Output {
        transcript.to_string()
    }
}

impl ImplementerRunner {
    pub fn new() -> Self {
        Self
    }

    /// Runs the agent once, verifies with the quality gate, and retries up
    /// to `max_quality_fix_attempts` times on failure. Mirrors
    /// `AgentRunner.run`: a zero-commit result short-circuits without
    /// entering the fix loop (there's nothing to fix), and quality-fix
    /// attempts are only spent when commits already exist.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        executor: &dyn Executor,
        bus: Option<&EventBus>,
        live: &LiveProcessSet,
        stream_config: &StreamReaderConfig,
        ctx: &PhaseContext,
        quality_gate_command: &[String],
        main_branch: &str,
        max_quality_fix_attempts: u32,
    ) -> Result<WorkerResult, PhaseError> {
        let start = Instant::now();
        let worktree_path = ctx
            .worktree_path
            .clone()
            .expect("implementer requires a worktree");

        let step = ImplementStep { extra_context: None };
        let transcript = run_phase(&step, executor, ctx, bus, live, stream_config).await?;

        let commits = count_commits(&worktree_path, main_branch, &ctx.branch).await;
        if commits == 0 {
            return Ok(WorkerResult {
                issue_number: ctx.issue.number,
                branch: ctx.branch.clone(),
                success: false,
                transcript,
                commits: 0,
                worktree_path: Some(worktree_path.display().to_string()),
                duration_seconds: start.elapsed().as_secs_f64(),
                error: Some("No commits found on branch".to_string()),
                quality_fix_attempts: 0,
                pr_info: None,
            });
        }

        let (mut success, mut error_output) = run_quality_gate(&worktree_path, quality_gate_command).await;
        let mut attempts = 0u32;
        let mut last_transcript = transcript;

        if !success && max_quality_fix_attempts > 0 {
            for attempt in 1..=max_quality_fix_attempts {
                attempts = attempt;
                let fix_step = ImplementStep {
                    extra_context: Some(&error_output),
                };
                last_transcript = run_phase(&fix_step, executor, ctx, bus, live, stream_config).await?;

                let (fixed, output) = run_quality_gate(&worktree_path, quality_gate_command).await;
                if fixed {
                    success = true;
                    break;
                }
                error_output = output;
            }
        }

        let final_commits = count_commits(&worktree_path, main_branch, &ctx.branch).await;

        Ok(WorkerResult {
            issue_number: ctx.issue.number,
            branch: ctx.branch.clone(),
            success,
            transcript: last_transcript,
            commits: final_commits,
            worktree_path: Some(worktree_path.display().to_string()),
            duration_seconds: start.elapsed().as_secs_f64(),
            error: if success { None } else { Some(error_output) },
            quality_fix_attempts: attempts,
            pr_info: None,
        })
    }
}

impl Default for ImplementerRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the configured quality-gate command, returning `(passed, tail of
/// combined stdout+stderr)`. A missing gate binary fails closed.
pub(crate) async fn run_quality_gate(worktree_path: &Path, command: &[String]) -> (bool, String) {
    let Some((program, args)) = command.split_first() else {
        return (true, String::new());
    };
    match tokio::process::Command::new(program)
        .args(args)
        .current_dir(worktree_path)
        .output()
        .await
    {
        Ok(output) if output.status.success() => (true, String::new()),
        Ok(output) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            (false, tail_chars(&combined, QUALITY_OUTPUT_TAIL).to_string())
        }
        Err(e) => (false, format!("{program} not found: {e}")),
    }
}

/// Commits on `branch` ahead of `main_branch`; `0` on any failure
/// (including "no such ref yet"), matching `_count_commits`'s
/// swallow-and-return-zero behavior.
pub(crate) async fn count_commits(worktree_path: &Path, main_branch: &str, branch: &str) -> u32 {
    let range = format!("origin/{main_branch}..{branch}");
    let output = tokio::process::Command::new("git")
        .args(["rev-list", "--count", &range])
        .current_dir(worktree_path)
        .output()
        .await;
    match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout)
            .trim()
            .parse()
            .unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn count_commits_is_zero_without_a_git_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let count = count_commits(tmp.path(), "main", "agent/issue-1").await;
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn quality_gate_empty_command_passes_trivially() {
        let tmp = tempfile::tempdir().unwrap();
        let (passed, output) = run_quality_gate(tmp.path(), &[]).await;
        assert!(passed);
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn quality_gate_failing_command_captures_output_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo boom && exit 1".to_string(),
        ];
        let (passed, output) = run_quality_gate(tmp.path(), &command).await;
        assert!(!passed);
        assert!(output.contains("boom"));
    }
}
