//! The `PhaseRunner` trait and its one generic driver: every phase follows
//! the identical build-argv / build-prompt / run / parse shape, so one
//! trait impl per phase plugs into a single shared driver function.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use hydra_executor::executor::{Executor, ExecutorError, SpawnSpec};
use hydra_executor::stream_reader::{self, LiveProcessSet, StreamReaderConfig, StreamReaderError};
use hydra_bus::EventBus;

use crate::context::PhaseContext;

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("agent reported an authentication failure: {0}")]
    Authentication(String),
    #[error("agent reported credit exhaustion: {0}")]
    CreditExhausted(String),
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
}

impl From<StreamReaderError> for PhaseError {
    fn from(err: StreamReaderError) -> Self {
        match err {
            StreamReaderError::Authentication(s) => PhaseError::Authentication(s),
            StreamReaderError::CreditExhausted(s) => PhaseError::CreditExhausted(s),
            StreamReaderError::Io(e) => PhaseError::Executor(e),
        }
    }
}

/// One class of agent invocation: build argv, build prompt, parse the
/// terminal transcript into a typed result.
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    type Output: Send;

    fn build_argv(&self, ctx: &PhaseContext) -> Vec<String>;
    fn build_prompt(&self, ctx: &PhaseContext) -> String;
    fn parse_result(&self, transcript: &str, ctx: &PhaseContext) -> Self::Output;

    /// Working directory for the spawned process; defaults to the
    /// context's worktree, falling back to the current directory for
    /// phases (triage, plan) that have no worktree of their own.
    fn cwd(&self, ctx: &PhaseContext) -> Option<PathBuf> {
        ctx.worktree_path.clone()
    }
}

/// argv build -> prompt build -> `executor.create_streaming_process` ->
/// `StreamReader` drive -> `parse_result`. Shared by every phase runner so
/// the auth/credit-exhaustion propagation policy lives in one place instead
/// of being re-implemented per phase.
pub async fn run_phase<R: PhaseRunner>(
    runner: &R,
    executor: &dyn Executor,
    ctx: &PhaseContext,
    bus: Option<&EventBus>,
    live: &LiveProcessSet,
    stream_config: &StreamReaderConfig,
) -> Result<R::Output, PhaseError> {
    let argv = runner.build_argv(ctx);
    let prompt = runner.build_prompt(ctx);
    let cwd = runner.cwd(ctx);

    let mut process = executor
        .create_streaming_process(SpawnSpec {
            argv,
            cwd,
            env: None,
        })
        .await?;

    let transcript = stream_reader::drive(
        process.as_mut(),
        &prompt,
        Some(ctx.issue.number),
        bus,
        live,
        stream_config,
    )
    .await?;

    Ok(runner.parse_result(&transcript, ctx))
}
