//! Per-issue git worktree lifecycle: create, destroy, merge main in, and
//! the env-prep steps an agent's subprocess needs to run inside one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use hydra_core::{best_effort_async, branch_name_for};

use crate::git_runner::GitRunner;

const UI_DIRS: &[&str] = &[
    "bot/health_ui",
    "tasks/ui",
    "control_plane/ui",
    "dashboard-service/health_ui",
];

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

#[derive(Debug, Clone, Default)]
pub struct GitIdentity {
    pub name: Option<String>,
    pub email: Option<String>,
}

pub struct WorktreeManager {
    repo_root: PathBuf,
    worktree_base: PathBuf,
    main_branch: String,
    identity: GitIdentity,
    git: Arc<dyn GitRunner>,
}

impl WorktreeManager {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        worktree_base: impl Into<PathBuf>,
        main_branch: impl Into<String>,
        identity: GitIdentity,
        git: Arc<dyn GitRunner>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktree_base: worktree_base.into(),
            main_branch: main_branch.into(),
            identity,
            git,
        }
    }

    pub fn path_for(&self, issue_number: u64) -> PathBuf {
        self.worktree_base.join(format!("issue-{issue_number}"))
    }

    pub fn exists(&self, issue_number: u64) -> bool {
        self.path_for(issue_number).is_dir()
    }

    /// Creates (or resumes) a worktree for `issue_number` on `branch`,
    /// idempotent against an already-prepared worktree.
    pub async fn create(&self, issue_number: u64, branch: &str) -> Result<PathBuf> {
        let wt_path = self.path_for(issue_number);
        if wt_path.is_dir() {
            return Ok(wt_path);
        }

        tokio::fs::create_dir_all(&self.worktree_base).await?;

        // Stale local branch from a prior crashed run; ignore failures.
        let _ = best_effort_async(
            "delete stale local branch",
            self.git.run_git(&self.repo_root, &["branch", "-D", branch]),
        )
        .await;

        self.run_checked(&["fetch", "origin", &self.main_branch]).await?;

        if self.remote_branch_exists(branch).await {
            info!(branch, issue = issue_number, "resuming from remote branch");
            let refspec = format!("+refs/heads/{branch}:refs/heads/{branch}");
            self.run_checked(&["fetch", "origin", &refspec]).await?;
        } else {
            let upstream = format!("origin/{}", self.main_branch);
            self.run_checked(&["branch", "-f", branch, &upstream]).await?;
        }

        let wt_path_str = wt_path.to_string_lossy().into_owned();
        self.run_checked(&["worktree", "add", &wt_path_str, branch]).await?;

        self.setup_env(&wt_path).await;
        self.configure_git_identity(&wt_path).await;
        self.create_venv(&wt_path).await;
        self.install_hooks(&wt_path).await;

        info!(path = %wt_path.display(), issue = issue_number, "worktree ready");
        Ok(wt_path)
    }

    pub async fn destroy(&self, issue_number: u64) -> Result<()> {
        let wt_path = self.path_for(issue_number);
        if wt_path.exists() {
            let path_str = wt_path.to_string_lossy().into_owned();
            let _ = best_effort_async(
                "remove worktree",
                self.git.run_git(&self.repo_root, &["worktree", "remove", "--force", &path_str]),
            )
            .await;
            info!(path = %wt_path.display(), "destroyed worktree");
        }

        let branch = branch_name_for(issue_number);
        let _ = best_effort_async(
            "delete issue branch",
            self.git.run_git(&self.repo_root, &["branch", "-D", &branch]),
        )
        .await;
        Ok(())
    }

    pub async fn destroy_all(&self) -> Result<()> {
        if !self.worktree_base.exists() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(&self.worktree_base).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(digits) = name.strip_prefix("issue-") {
                if let Ok(number) = digits.parse::<u64>() {
                    self.destroy(number).await?;
                }
            }
        }
        let _ = best_effort_async("prune worktrees", self.git.run_git(&self.repo_root, &["worktree", "prune"])).await;
        Ok(())
    }

    /// Fetches main and merges it in, aborting and returning `false` on
    /// any conflict. Used before a review begins. Tries a fast-forward
    /// merge first (the common case once main hasn't diverged from a
    /// prior merge); falls back to a real merge commit only when a
    /// fast-forward isn't possible.
    pub async fn merge_main(&self, path: &Path) -> Result<bool> {
        self.fetch_main(path).await?;
        let upstream = format!("origin/{}", self.main_branch);
        let ff = self.git.run_git(path, &["merge", "--ff-only", &upstream]).await?;
        if ff.success {
            return Ok(true);
        }
        let result = self.git.run_git(path, &["merge", &upstream, "--no-edit"]).await?;
        if result.success {
            return Ok(true);
        }
        warn!(path = %path.display(), stderr = %result.stderr, "merge conflict, aborting");
        let _ = best_effort_async("abort conflicted merge", self.git.run_git(path, &["merge", "--abort"])).await;
        Ok(false)
    }

    /// Same as [`merge_main`](Self::merge_main) but leaves conflict
    /// markers in place on failure instead of aborting, so an agent can
    /// resolve them itself.
    pub async fn start_merge_main(&self, path: &Path) -> Result<bool> {
        self.fetch_main(path).await?;
        let upstream = format!("origin/{}", self.main_branch);
        let ff = self.git.run_git(path, &["merge", "--ff-only", &upstream]).await?;
        if ff.success {
            return Ok(true);
        }
        let result = self.git.run_git(path, &["merge", &upstream, "--no-edit"]).await?;
        Ok(result.success)
    }

    pub async fn abort_merge(&self, path: &Path) -> Result<()> {
        let _ = best_effort_async("abort merge", self.git.run_git(path, &["merge", "--abort"])).await;
        Ok(())
    }

    /// Pushes `branch`'s current HEAD (checked out at `path`) to `origin`.
    /// Main is always merged (never rebased) into the branch, so the
    /// branch's history only ever grows forward — a plain push stays
    /// fast-forward and no force flag is needed.
    pub async fn push_branch(&self, path: &Path, branch: &str) -> Result<()> {
        let output = self
            .git
            .run_git(path, &["push", "origin", branch])
            .await?;
        if output.success {
            Ok(())
        } else {
            Err(WorktreeError::GitCommand(output.stderr))
        }
    }

    /// `git log HEAD..origin/<main> --oneline -30`, for context prompts.
    /// Empty string on any failure rather than a propagated error.
    pub async fn get_main_commits_since_diverge(&self, path: &Path) -> String {
        if self.git.run_git(path, &["fetch", "origin", &self.main_branch]).await.is_err() {
            return String::new();
        }
        let range = format!("HEAD..origin/{}", self.main_branch);
        match self
            .git
            .run_git(path, &["log", &range, "--oneline", "-30"])
            .await
        {
            Ok(output) if output.success => output.stdout,
            _ => String::new(),
        }
    }

    async fn fetch_main(&self, path: &Path) -> Result<()> {
        self.git.run_git(path, &["fetch", "origin", &self.main_branch]).await?;
        Ok(())
    }

    async fn remote_branch_exists(&self, branch: &str) -> bool {
        match self
            .git
            .run_git(&self.repo_root, &["ls-remote", "--heads", "origin", branch])
            .await
        {
            Ok(output) => output.success && !output.stdout_trimmed().is_empty(),
            Err(_) => false,
        }
    }

    async fn run_checked(&self, args: &[&str]) -> Result<()> {
        let output = self.git.run_git(&self.repo_root, args).await?;
        if output.success {
            Ok(())
        } else {
            Err(WorktreeError::GitCommand(output.stderr))
        }
    }

    async fn setup_env(&self, wt_path: &Path) {
        let env_src = self.repo_root.join(".env");
        let env_dst = wt_path.join(".env");
        if env_src.exists() && !env_dst.exists() {
            if let Err(e) = tokio::fs::symlink(&env_src, &env_dst).await {
                warn!(error = %e, "failed to symlink .env");
            }
        }

        let settings_src = self.repo_root.join(".claude").join("settings.local.json");
        let settings_dst = wt_path.join(".claude").join("settings.local.json");
        if settings_src.exists() && !settings_dst.exists() {
            if let Some(parent) = settings_dst.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            if let Err(e) = tokio::fs::copy(&settings_src, &settings_dst).await {
                warn!(error = %e, "failed to copy .claude/settings.local.json");
            }
        }

        for ui_dir in UI_DIRS {
            let nm_src = self.repo_root.join(ui_dir).join("node_modules");
            let nm_dst = wt_path.join(ui_dir).join("node_modules");
            if nm_src.exists() && !nm_dst.exists() {
                if let Some(parent) = nm_dst.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if let Err(e) = tokio::fs::symlink(&nm_src, &nm_dst).await {
                    warn!(error = %e, ui_dir, "failed to symlink node_modules");
                }
            }
        }
    }

    async fn configure_git_identity(&self, wt_path: &Path) {
        if let Some(name) = &self.identity.name {
            let _ = self.git.run_git(wt_path, &["config", "user.name", name]).await;
        }
        if let Some(email) = &self.identity.email {
            let _ = self.git.run_git(wt_path, &["config", "user.email", email]).await;
        }
    }

    async fn create_venv(&self, wt_path: &Path) {
        if let Err(e) = run_uv_sync(wt_path).await {
            warn!(path = %wt_path.display(), error = %e, "uv sync failed");
        }
    }

    async fn install_hooks(&self, wt_path: &Path) {
        if let Err(e) = self
            .git
            .run_git(wt_path, &["config", "core.hooksPath", ".githooks"])
            .await
        {
            warn!(error = %e, "failed to set core.hooksPath");
        }
    }
}

async fn run_uv_sync(wt_path: &Path) -> std::io::Result<()> {
    let status = tokio::process::Command::new("uv")
        .arg("sync")
        .current_dir(wt_path)
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("uv sync exited with {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_runner::GitOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeGit {
        calls: Mutex<Vec<Vec<String>>>,
        remote_branch_exists: bool,
    }

    #[async_trait]
    impl GitRunner for FakeGit {
        async fn run_git(&self, _dir: &Path, args: &[&str]) -> std::io::Result<GitOutput> {
            self.calls
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            if args.first() == Some(&"ls-remote") {
                let stdout = if self.remote_branch_exists {
                    "abc123\trefs/heads/agent/issue-1\n".to_string()
                } else {
                    String::new()
                };
                return Ok(GitOutput {
                    success: true,
                    stdout,
                    stderr: String::new(),
                });
            }
            Ok(GitOutput {
                success: true,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn destroy_all_ignores_non_issue_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("worktrees");
        tokio::fs::create_dir_all(base.join("issue-42")).await.unwrap();
        tokio::fs::create_dir_all(base.join("scratch")).await.unwrap();

        let git = Arc::new(FakeGit {
            calls: Mutex::new(vec![]),
            remote_branch_exists: false,
        });
        let manager = WorktreeManager::new(
            tmp.path(),
            &base,
            "main",
            GitIdentity::default(),
            git.clone(),
        );
        manager.destroy_all().await.unwrap();

        let calls = git.calls.lock().unwrap();
        let branch_deletes = calls
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some("branch"))
            .count();
        assert_eq!(branch_deletes, 1);
    }

    #[tokio::test]
    async fn path_for_matches_issue_number_scheme() {
        let tmp = tempfile::tempdir().unwrap();
        let git = Arc::new(FakeGit {
            calls: Mutex::new(vec![]),
            remote_branch_exists: false,
        });
        let manager = WorktreeManager::new(
            tmp.path(),
            tmp.path().join("worktrees"),
            "main",
            GitIdentity::default(),
            git,
        );
        assert_eq!(
            manager.path_for(7),
            tmp.path().join("worktrees").join("issue-7")
        );
    }

    #[tokio::test]
    async fn push_branch_uses_a_plain_push() {
        let tmp = tempfile::tempdir().unwrap();
        let git = Arc::new(FakeGit {
            calls: Mutex::new(vec![]),
            remote_branch_exists: false,
        });
        let manager = WorktreeManager::new(
            tmp.path(),
            tmp.path().join("worktrees"),
            "main",
            GitIdentity::default(),
            git.clone(),
        );
        manager
            .push_branch(tmp.path(), "agent/issue-7")
            .await
            .unwrap();

        let calls = git.calls.lock().unwrap();
        assert_eq!(
            calls.last().unwrap(),
            &["push", "origin", "agent/issue-7"]
        );
    }

    #[tokio::test]
    async fn merge_main_tries_fast_forward_before_a_real_merge() {
        let tmp = tempfile::tempdir().unwrap();
        let git = Arc::new(FakeGit {
            calls: Mutex::new(vec![]),
            remote_branch_exists: false,
        });
        let manager = WorktreeManager::new(
            tmp.path(),
            tmp.path().join("worktrees"),
            "main",
            GitIdentity::default(),
            git.clone(),
        );
        assert!(manager.merge_main(tmp.path()).await.unwrap());

        let calls = git.calls.lock().unwrap();
        assert!(calls
            .iter()
            .any(|c| c.first().map(String::as_str) == Some("merge") && c.contains(&"--ff-only".to_string())));
    }
}
