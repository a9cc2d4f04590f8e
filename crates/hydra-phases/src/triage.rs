//! Triage runner: judges whether an issue is ready to enter the plan
//! stage. A judgement operation, so its argv carries a read-only tool
//! denylist rather than the implementer's full toolset.

use async_trait::async_trait;
use std::sync::LazyLock;

use regex::Regex;

use crate::context::PhaseContext;
use crate::runner::PhaseRunner;

static TRIAGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)TRIAGE:\s*(READY|DEFER)").expect("valid regex"));

#[derive(Debug, Clone)]
pub struct TriageOutcome {
    pub issue_number: u64,
    pub ready: bool,
    pub rationale: String,
}

pub struct TriageRunner {
    pub denylisted_tools: Vec<String>,
}

impl TriageRunner {
    pub fn new(denylisted_tools: Vec<String>) -> Self {
        Self { denylisted_tools }
    }
}

#[async_trait]
impl PhaseRunner for TriageRunner {
    type Output = TriageOutcome;

    fn build_argv(&self, ctx: &PhaseContext) -> Vec<String> {
        let mut argv = vec![
            "claude".to_string(),
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--model".to_string(),
            ctx.model.clone(),
            "--verbose".to_string(),
        ];
        for tool in &self.denylisted_tools {
            argv.push("--disallowedTools".to_string());
            argv.push(tool.clone());
        }
        if ctx.max_budget_usd > 0.0 {
            argv.push("--max-budget-usd".to_string());
            argv.push(ctx.max_budget_usd.to_string());
        }
        argv
    }

    fn build_prompt(&self, ctx: &PhaseContext) -> String {
        format!(
            "Triage issue #{}: {}\n\n{}\n\nDecide whether this issue is ready to be planned. \
             End your response with a line `TRIAGE: READY` or `TRIAGE: DEFER` followed by a \
             one-sentence rationale.",
            ctx.issue.number, ctx.issue.title, ctx.issue.body
        )
    }

    // Triage is a judgement step with no modifications, so it never needs
    // its own worktree.
    fn cwd(&self, _ctx: &PhaseContext) -> Option<std::path::PathBuf> {
        None
    }

    fn parse_result(&self, transcript: &str, ctx: &PhaseContext) -> Self::Output {
        let ready = TRIAGE_PATTERN
            .captures(transcript)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().eq_ignore_ascii_case("ready"))
            .unwrap_or(false);

        let rationale = transcript
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_string();

        TriageOutcome {
            issue_number: ctx.issue.number,
            ready,
            rationale,
        }
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
                number: 1,
                title: "t".into(),
                body: "b".into(),
                labels: BTreeSet::new(),
                comments: vec![],
                url: String::new(),
            },
            "agent/issue-1".into(),
            "sonnet".into(),
            0.0,
        )
    }

    #[test]
    fn defaults_to_not_ready_on_missing_sentinel() {
        let runner = TriageRunner::new(vec![]);
        let outcome = runner.parse_result("no sentinel here", &ctx());
        assert!(!outcome.ready);
    }

    #[test]
    fn parses_ready_sentinel() {
        let runner = TriageRunner::new(vec![]);
        let outcome = runner.parse_result("reasoning...\nTRIAGE: READY", &ctx());
        assert!(outcome.ready);
    }
}
