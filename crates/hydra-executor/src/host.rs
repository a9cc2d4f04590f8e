//! Host-process backend: launches the agent directly via `tokio::process`.
//!
//! `CLAUDECODE` is stripped from the child's environment centrally here
//! (rather than at each phase-runner call site) so the orchestrator is
//! never misidentified as an agent by a nested invocation.

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::executor::{Executor, ExecutorError, Process, SimpleResult, SpawnSpec};

pub struct HostExecutor;

impl HostExecutor {
    pub fn new() -> Self {
        Self
    }

    fn build_command(spec: &SpawnSpec) -> Result<tokio::process::Command, ExecutorError> {
        let [bin, args @ ..] = spec.argv.as_slice() else {
            return Err(ExecutorError::Spawn(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty argv",
            )));
        };
        let mut cmd = tokio::process::Command::new(bin);
        cmd.args(args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.env_remove("CLAUDECODE");
        if let Some(env) = &spec.env {
            cmd.env_clear();
            cmd.envs(env);
            cmd.env_remove("CLAUDECODE");
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // New process group so the runner can signal the whole tree on
        // shutdown rather than just the immediate child.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        Ok(cmd)
    }
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn create_streaming_process(
        &self,
        spec: SpawnSpec,
    ) -> Result<Box<dyn Process>, ExecutorError> {
        let mut cmd = Self::build_command(&spec)?;
        let mut child = cmd.spawn().map_err(ExecutorError::Spawn)?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .map(|s| BufReader::new(s).lines())
            .expect("stdout was piped");
        let stderr = child.stderr.take();

        let stderr_buf = std::sync::Arc::new(Mutex::new(String::new()));
        if let Some(mut stderr) = stderr {
            let buf = stderr_buf.clone();
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                let mut bytes = Vec::new();
                if stderr.read_to_end(&mut bytes).await.is_ok() {
                    let mut guard = buf.lock().await;
                    guard.push_str(&String::from_utf8_lossy(&bytes));
                }
            });
        }

        Ok(Box::new(HostProcess {
            id: Uuid::new_v4(),
            child,
            stdin,
            stdout,
            stderr_buf,
        }))
    }

    async fn run_simple(
        &self,
        spec: SpawnSpec,
        timeout: Duration,
    ) -> Result<SimpleResult, ExecutorError> {
        let mut cmd = Self::build_command(&spec)?;
        let mut child = cmd.spawn().map_err(ExecutorError::Spawn)?;
        let output = tokio::time::timeout(timeout, child.wait_with_output()).await;
        match output {
            Ok(Ok(output)) => Ok(SimpleResult {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
            }),
            Ok(Err(e)) => Err(ExecutorError::Io(e)),
            Err(_) => Err(ExecutorError::Timeout(timeout)),
        }
    }

    async fn cleanup(&self) {}
}

struct HostProcess {
    id: Uuid,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_buf: std::sync::Arc<Mutex<String>>,
}

#[async_trait]
impl Process for HostProcess {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecutorError> {
        if let Some(stdin) = self.stdin.as_mut() {
            stdin.write_all(data).await?;
        }
        Ok(())
    }

    async fn close_stdin(&mut self) -> Result<(), ExecutorError> {
        self.stdin.take();
        Ok(())
    }

    async fn next_stdout_line(&mut self) -> Option<String> {
        self.stdout.next_line().await.ok().flatten()
    }

    fn stderr_snapshot(&self) -> String {
        self.stderr_buf.try_lock().map(|g| g.clone()).unwrap_or_default()
    }

    async fn kill(&mut self) -> Result<(), ExecutorError> {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::killpg(pid as i32, libc::SIGTERM);
            }
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await;
        let _ = self.child.start_kill();
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>, ExecutorError> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}
