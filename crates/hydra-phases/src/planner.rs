//! Planner runner: turns a triaged issue into an implementation plan
//! comment. Plan entry always advances to the ready label; there is no
//! defer branch.

use async_trait::async_trait;

use crate::context::PhaseContext;
use crate::runner::PhaseRunner;

#[derive(Debug, Clone)]
pub struct PlanOutput {
    pub issue_number: u64,
    pub plan_text: String,
}

pub struct PlannerRunner {
    pub denylisted_tools: Vec<String>,
}

impl PlannerRunner {
    pub fn new(denylisted_tools: Vec<String>) -> Self {
        Self { denylisted_tools }
    }
}

#[async_trait]
impl PhaseRunner for PlannerRunner {
    type Output = PlanOutput;

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
        argv
    }

    fn build_prompt(&self, ctx: &PhaseContext) -> String {
        format!(
            "Write an implementation plan for issue #{}: {}\n\n{}\n\n\
             Produce a `## Implementation Plan` section describing the approach, \
             the files likely to change, and risks.",
            ctx.issue.number, ctx.issue.title, ctx.issue.body
        )
    }

    fn cwd(&self, _ctx: &PhaseContext) -> Option<std::path::PathBuf> {
        None
    }

    fn parse_result(&self, transcript: &str, ctx: &PhaseContext) -> Self::Output {
        PlanOutput {
            issue_number: ctx.issue.number,
            plan_text: transcript.to_string(),
        }
    }
}
