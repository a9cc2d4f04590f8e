//! Async git command execution, abstracted behind a trait so the manager
//! can be exercised against a fake in tests.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn run_git(&self, dir: &std::path::Path, args: &[&str]) -> std::io::Result<GitOutput>;
}

pub struct RealGitRunner;

#[async_trait]
impl GitRunner for RealGitRunner {
    async fn run_git(&self, dir: &std::path::Path, args: &[&str]) -> std::io::Result<GitOutput> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
