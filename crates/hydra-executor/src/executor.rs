//! Uniform interface over host-process and isolated-container backends:
//! an `async_trait` spawn interface returning a handle with reader/writer
//! channels and a liveness flag.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("process timed out after {0:?}")]
    Timeout(Duration),
    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("container backend error: {0}")]
    Container(String),
    #[error("container daemon unreachable: {0}")]
    ContainerUnavailable(String),
}

#[derive(Debug, Clone, Default)]
pub struct SimpleResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl SimpleResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
}

/// A running subprocess (or container), abstracted so phase runners never
/// know which backend launched it.
#[async_trait]
pub trait Process: Send {
    fn id(&self) -> Uuid;

    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecutorError>;

    async fn close_stdin(&mut self) -> Result<(), ExecutorError>;

    /// Returns the next complete line of stdout (without its trailing
    /// `\n`), or `None` on EOF. The final line before EOF may lack a
    /// trailing newline; it is still yielded once, then `None` follows.
    async fn next_stdout_line(&mut self) -> Option<String>;

    /// Best-effort snapshot of stderr accumulated so far.
    fn stderr_snapshot(&self) -> String;

    async fn kill(&mut self) -> Result<(), ExecutorError>;

    async fn wait(&mut self) -> Result<Option<i32>, ExecutorError>;
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn create_streaming_process(&self, spec: SpawnSpec) -> Result<Box<dyn Process>, ExecutorError>;

    async fn run_simple(&self, spec: SpawnSpec, timeout: Duration) -> Result<SimpleResult, ExecutorError>;

    async fn cleanup(&self);
}
