//! Reviewer runner: reviews a pull request's diff, optionally makes fixes,
//! and returns a verdict.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;

use hydra_core::{PrInfo, ReviewResult, ReviewVerdict};
use hydra_executor::executor::Executor;

use crate::context::PhaseContext;
use crate::runner::{run_phase, PhaseError, PhaseRunner};
use crate::sentinels::{extract_summary, parse_verdict, tail_chars};
use hydra_bus::EventBus;
use hydra_executor::stream_reader::{LiveProcessSet, StreamReaderConfig};

const MAX_DIFF_CHARS: usize = 60_000;
const QUALITY_OUTPUT_TAIL: usize = 3000;

pub struct ReviewerRunner;

impl ReviewerRunner {
    pub fn new() -> Self {
        Self
    }

    /// Reviews `pr`'s diff against `ctx`'s issue. Swallows agent failures
    /// into a `COMMENT` verdict rather than propagating, mirroring
    /// `review`'s broad `except Exception` fallback — a reviewer that
    /// crashed said nothing useful about the PR, which is itself a
    /// result worth recording rather than aborting the batch over.
    pub async fn review(
        &self,
        executor: &dyn Executor,
        bus: Option<&EventBus>,
        live: &LiveProcessSet,
        stream_config: &StreamReaderConfig,
        ctx: &PhaseContext,
        pr: &PrInfo,
        diff: &str,
        ci_fix_enabled: bool,
    ) -> Result<ReviewResult, PhaseError> {
        let start = Instant::now();
        let worktree_path = ctx
            .worktree_path
            .clone()
            .expect("reviewer requires a worktree");

        let step = ReviewStep {
            pr,
            diff,
            ci_fix_enabled,
        };
        let before_sha = head_sha(&worktree_path).await;
        let transcript = run_phase(&step, executor, ctx, bus, live, stream_config).await?;

        let verdict = parse_verdict(&transcript);
        let summary = extract_summary(&transcript);
        let fixes_made = has_changes(&worktree_path, before_sha.as_deref()).await;

        Ok(ReviewResult {
            pr_number: pr.number,
            issue_number: ctx.issue.number,
            verdict,
            summary,
            fixes_made,
            transcript,
            merged: false,
            ci_passed: false,
            ci_fix_attempts: 0,
            duration_seconds: start.elapsed().as_secs_f64(),
        })
    }

    /// Runs an agent to fix CI failures on an already-reviewed PR.
    /// Same shape as [`review`](Self::review) but with a fix-oriented
    /// prompt embedding the last CI failure summary.
    pub async fn fix_ci(
        &self,
        executor: &dyn Executor,
        bus: Option<&EventBus>,
        live: &LiveProcessSet,
        stream_config: &StreamReaderConfig,
        ctx: &PhaseContext,
        pr: &PrInfo,
        failure_summary: &str,
        attempt: u32,
    ) -> Result<ReviewResult, PhaseError> {
        let start = Instant::now();
        let worktree_path = ctx
            .worktree_path
            .clone()
            .expect("ci-fix requires a worktree");

        let step = CiFixStep {
            pr,
            failure_summary,
            attempt,
        };
        let before_sha = head_sha(&worktree_path).await;
        let transcript = run_phase(&step, executor, ctx, bus, live, stream_config).await?;

        let verdict = parse_verdict(&transcript);
        let summary = extract_summary(&transcript);
        let fixes_made = has_changes(&worktree_path, before_sha.as_deref()).await;

        Ok(ReviewResult {
            pr_number: pr.number,
            issue_number: ctx.issue.number,
            verdict,
            summary,
            fixes_made,
            transcript,
            merged: false,
            ci_passed: false,
            ci_fix_attempts: attempt,
            duration_seconds: start.elapsed().as_secs_f64(),
        })
    }
}

impl Default for ReviewerRunner {
    fn default() -> Self {
        Self::new()
    }
}

struct ReviewStep<'a> {
    pr: &'a PrInfo,
    diff: &'a str,
    ci_fix_enabled: bool,
}

#[async_trait]
impl PhaseRunner for ReviewStep<'_> {
    type Output = String;

    fn build_argv(&self, ctx: &PhaseContext) -> Vec<String> {
        review_argv(ctx)
    }

    fn build_prompt(&self, ctx: &PhaseContext) -> String {
        let diff_text = if self.diff.chars().count() > MAX_DIFF_CHARS {
            format!(
                "{}\n\n[Diff truncated at {MAX_DIFF_CHARS} chars — review may be incomplete for large PRs]",
                tail_chars(self.diff, MAX_DIFF_CHARS)
            )
        } else {
            self.diff.to_string()
        };

        let verify_step = if self.ci_fix_enabled {
            "Do NOT run the quality gate locally — CI will verify it after review."
        } else {
            "Run the project's quality gate to verify everything passes."
        };

        format!(
            "You are reviewing PR #{} which implements issue #{}.\n\n\
             ## Issue: {}\n\n{}\n\n\
             ## PR Diff\n\n```diff\n{diff_text}\n```\n\n\
             ## Review Dimensions\n\n\
             Review this PR across three dimensions: correctness (does the code work as \
             intended, are edge cases and errors handled), completeness (does the \
             implementation address every requirement from the issue), and quality (style, \
             naming, test coverage, security, CLAUDE.md compliance).\n\n\
             If you find issues you can fix, make the fixes directly and commit them. \
             {verify_step}\n\n\
             ## Required Output\n\n\
             End your response with EXACTLY one of these verdict lines:\n\
             - VERDICT: APPROVE\n\
             - VERDICT: REQUEST_CHANGES\n\
             - VERDICT: COMMENT\n\n\
             Then a brief summary on the next line starting with \"SUMMARY: \".\n\n\
             ## Optional: Memory Suggestion\n\n\
             If you discover a reusable pattern or insight during this review, you may \
             output one suggestion wrapped in a MEMORY_SUGGESTION_START/MEMORY_SUGGESTION_END \
             block. Only suggest genuinely valuable learnings.\n",
            self.pr.number, ctx.issue.number, ctx.issue.title, ctx.issue.body
        )
    }

    fn parse_result(&self, transcript: &str, _ctx: &PhaseContext) -> Self::Output {
        transcript.to_string()
    }
}

struct CiFixStep<'a> {
    pr: &'a PrInfo,
    failure_summary: &'a str,
    attempt: u32,
}

#[async_trait]
impl PhaseRunner for CiFixStep<'_> {
    type Output = String;

    fn build_argv(&self, ctx: &PhaseContext) -> Vec<String> {
        review_argv(ctx)
    }

    fn build_prompt(&self, ctx: &PhaseContext) -> String {
        format!(
            "You are fixing CI failures on PR #{} (issue #{}: {}).\n\n\
             ## CI Failure Summary\n\n{}\n\n\
             ## Fix Attempt {}\n\n\
             Read the failing CI output above, fix the root causes, and commit your fixes \
             with message \"ci-fix: <description> (PR #{})\". Do NOT skip or disable tests.\n\n\
             ## Required Output\n\n\
             End your response with EXACTLY one of these verdict lines:\n\
             - VERDICT: APPROVE   (if CI failures are fixed)\n\
             - VERDICT: REQUEST_CHANGES  (if you could not fix them)\n\n\
             Then a brief summary on the next line starting with \"SUMMARY: \".\n",
            self.pr.number,
            ctx.issue.number,
            ctx.issue.title,
            tail_chars(self.failure_summary, QUALITY_OUTPUT_TAIL),
            self.attempt,
            self.pr.number,
        )
    }

    fn parse_result(&self, transcript: &str, _ctx: &PhaseContext) -> Self::Output {
        transcript.to_string()
    }
}

fn review_argv(ctx: &PhaseContext) -> Vec<String> {
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

async fn head_sha(worktree_path: &Path) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(worktree_path)
        .output()
        .await
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

/// True if HEAD moved since `before_sha`, or the worktree has staged or
/// unstaged changes — covers both "agent committed" and "agent edited but
/// forgot to commit" cases.
async fn has_changes(worktree_path: &Path, before_sha: Option<&str>) -> bool {
    let current = head_sha(worktree_path).await;
    if let (Some(before), Some(current)) = (before_sha, current.as_deref()) {
        if before != current {
            return true;
        }
    }
    let output = tokio::process::Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(worktree_path)
        .output()
        .await;
    matches!(output, Ok(o) if o.status.success() && !o.stdout.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn head_sha_is_none_without_a_git_repo() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(head_sha(tmp.path()).await.is_none());
    }

    #[tokio::test]
    async fn has_changes_is_false_without_a_git_repo() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!has_changes(tmp.path(), None).await);
    }
}
