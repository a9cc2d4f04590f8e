//! Layered configuration: CLI flags > `--config-file` JSON > built-in
//! defaults, one struct per concern (labels, concurrency, models, CI,
//! container).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Every field optional: used to overlay a `--config-file` on top of
/// built-in defaults, with CLI flags overlaid on top of that in turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub repo: Option<String>,
    pub find_label: Option<String>,
    pub plan_label: Option<String>,
    pub ready_label: Option<String>,
    pub review_label: Option<String>,
    pub fixed_label: Option<String>,
    pub hitl_label: Option<String>,
    pub epic_label: Option<String>,
    pub dup_label: Option<String>,
    pub improve_label: Option<String>,

    pub batch_size: Option<u32>,
    pub max_workers: Option<usize>,
    pub max_planners: Option<usize>,
    pub max_reviewers: Option<usize>,
    pub max_hitl_workers: Option<usize>,

    pub model: Option<String>,
    pub review_model: Option<String>,
    pub max_budget_usd: Option<f64>,
    pub review_budget_usd: Option<f64>,

    pub max_quality_fix_attempts: Option<u32>,
    pub max_issue_attempts: Option<u32>,
    pub max_ci_fix_attempts: Option<u32>,
    pub ci_check_timeout: Option<u64>,
    pub ci_poll_interval: Option<u64>,

    pub quality_gate_command: Option<Vec<String>>,
    pub main_branch: Option<String>,
    pub worktree_base: Option<PathBuf>,
    pub repo_root: Option<PathBuf>,

    pub docker: Option<bool>,
    pub docker_image: Option<String>,
    pub docker_cpu_limit: Option<f64>,
    pub docker_memory_mb: Option<u64>,
    pub docker_pids_limit: Option<i64>,
    pub docker_network: Option<String>,
    pub container_spawn_delay_secs: Option<f64>,

    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,

    pub poll_interval_secs: Option<u64>,
    pub session_cap: Option<usize>,
    pub quality_fix_rate_threshold: Option<f64>,
    pub approval_rate_threshold: Option<f64>,
    pub hitl_rate_threshold: Option<f64>,

    pub dry_run: Option<bool>,
    pub once: Option<bool>,
}

impl FileConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fill every `None` field in `self` from `other`, preferring `self`'s
    /// values where both are set. Used to layer CLI-derived config over a
    /// file-derived one.
    pub fn merge_over(mut self, other: FileConfig) -> Self {
        macro_rules! fill {
            ($($field:ident),* $(,)?) => {
                $(if self.$field.is_none() { self.$field = other.$field; })*
            };
        }
        fill!(
            repo,
            find_label,
            plan_label,
            ready_label,
            review_label,
            fixed_label,
            hitl_label,
            epic_label,
            dup_label,
            improve_label,
            batch_size,
            max_workers,
            max_planners,
            max_reviewers,
            max_hitl_workers,
            model,
            review_model,
            max_budget_usd,
            review_budget_usd,
            max_quality_fix_attempts,
            max_issue_attempts,
            max_ci_fix_attempts,
            ci_check_timeout,
            ci_poll_interval,
            quality_gate_command,
            main_branch,
            worktree_base,
            repo_root,
            docker,
            docker_image,
            docker_cpu_limit,
            docker_memory_mb,
            docker_pids_limit,
            docker_network,
            container_spawn_delay_secs,
            git_user_name,
            git_user_email,
            poll_interval_secs,
            session_cap,
            quality_fix_rate_threshold,
            approval_rate_threshold,
            hitl_rate_threshold,
            dry_run,
            once,
        );
        self
    }
}

/// Fully resolved configuration — every field has a concrete value. This is
/// what the rest of the crate consumes; `FileConfig` only exists to model
/// the overlay-of-optionals layering step.
#[derive(Debug, Clone)]
pub struct HydraConfig {
    pub repo: String,
    pub find_label: String,
    pub plan_label: String,
    pub ready_label: String,
    pub review_label: String,
    pub fixed_label: String,
    pub hitl_label: String,
    pub epic_label: String,
    pub dup_label: String,
    pub improve_label: String,

    pub batch_size: u32,
    pub max_workers: usize,
    pub max_planners: usize,
    pub max_reviewers: usize,
    pub max_hitl_workers: usize,

    pub model: String,
    pub review_model: String,
    pub max_budget_usd: f64,
    pub review_budget_usd: f64,

    pub max_quality_fix_attempts: u32,
    pub max_issue_attempts: u32,
    pub max_ci_fix_attempts: u32,
    pub ci_check_timeout: u64,
    pub ci_poll_interval: u64,

    pub quality_gate_command: Vec<String>,
    pub main_branch: String,
    pub worktree_base: PathBuf,
    pub repo_root: PathBuf,

    pub docker: bool,
    pub docker_image: Option<String>,
    pub docker_cpu_limit: f64,
    pub docker_memory_mb: u64,
    pub docker_pids_limit: i64,
    pub docker_network: Option<String>,
    pub container_spawn_delay_secs: f64,

    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,

    pub poll_interval_secs: u64,
    pub session_cap: usize,
    pub quality_fix_rate_threshold: f64,
    pub approval_rate_threshold: f64,
    pub hitl_rate_threshold: f64,

    pub dry_run: bool,
    pub once: bool,
}

impl HydraConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.repo_root.join(".hydraflow")
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.state_dir().join("sessions.jsonl")
    }

    pub fn from_overlay(overlay: FileConfig) -> Self {
        let d = FileConfig::default_values();
        let f = overlay.merge_over(d);
        let repo_root = f.repo_root.unwrap_or_else(|| PathBuf::from("."));
        let worktree_base = f
            .worktree_base
            .unwrap_or_else(|| repo_root.join(".hydraflow").join("worktrees"));
        HydraConfig {
            repo: f.repo.unwrap_or_default(),
            find_label: f.find_label.unwrap(),
            plan_label: f.plan_label.unwrap(),
            ready_label: f.ready_label.unwrap(),
            review_label: f.review_label.unwrap(),
            fixed_label: f.fixed_label.unwrap(),
            hitl_label: f.hitl_label.unwrap(),
            epic_label: f.epic_label.unwrap(),
            dup_label: f.dup_label.unwrap(),
            improve_label: f.improve_label.unwrap(),
            batch_size: f.batch_size.unwrap(),
            max_workers: f.max_workers.unwrap(),
            max_planners: f.max_planners.unwrap(),
            max_reviewers: f.max_reviewers.unwrap(),
            max_hitl_workers: f.max_hitl_workers.unwrap(),
            model: f.model.unwrap(),
            review_model: f.review_model.unwrap(),
            max_budget_usd: f.max_budget_usd.unwrap(),
            review_budget_usd: f.review_budget_usd.unwrap(),
            max_quality_fix_attempts: f.max_quality_fix_attempts.unwrap(),
            max_issue_attempts: f.max_issue_attempts.unwrap(),
            max_ci_fix_attempts: f.max_ci_fix_attempts.unwrap(),
            ci_check_timeout: f.ci_check_timeout.unwrap(),
            ci_poll_interval: f.ci_poll_interval.unwrap(),
            quality_gate_command: f.quality_gate_command.unwrap(),
            main_branch: f.main_branch.unwrap(),
            worktree_base,
            repo_root,
            docker: f.docker.unwrap(),
            docker_image: f.docker_image,
            docker_cpu_limit: f.docker_cpu_limit.unwrap(),
            docker_memory_mb: f.docker_memory_mb.unwrap(),
            docker_pids_limit: f.docker_pids_limit.unwrap(),
            docker_network: f.docker_network,
            container_spawn_delay_secs: f.container_spawn_delay_secs.unwrap(),
            git_user_name: f.git_user_name,
            git_user_email: f.git_user_email,
            poll_interval_secs: f.poll_interval_secs.unwrap(),
            session_cap: f.session_cap.unwrap(),
            quality_fix_rate_threshold: f.quality_fix_rate_threshold.unwrap(),
            approval_rate_threshold: f.approval_rate_threshold.unwrap(),
            hitl_rate_threshold: f.hitl_rate_threshold.unwrap(),
            dry_run: f.dry_run.unwrap(),
            once: f.once.unwrap(),
        }
    }
}

impl FileConfig {
    /// Built-in defaults (`--ready-label hydra-ready`, `--batch-size 15`,
    /// `--max-workers 2`, `--model sonnet`, `--review-model opus`,
    /// `--ci-check-timeout 600`, `--ci-poll-interval 30`,
    /// `--max-ci-fix-attempts 2`, ...).
    fn default_values() -> FileConfig {
        FileConfig {
            repo: Some(String::new()),
            find_label: Some("hydra-find".into()),
            plan_label: Some("hydra-plan".into()),
            ready_label: Some("hydra-ready".into()),
            review_label: Some("hydra-review".into()),
            fixed_label: Some("hydra-fixed".into()),
            hitl_label: Some("hydra-hitl".into()),
            epic_label: Some("hydra-epic".into()),
            dup_label: Some("duplicate".into()),
            improve_label: Some("hydra-improve".into()),
            batch_size: Some(15),
            max_workers: Some(2),
            max_planners: Some(1),
            max_reviewers: Some(1),
            max_hitl_workers: Some(1),
            model: Some("sonnet".into()),
            review_model: Some("opus".into()),
            max_budget_usd: Some(0.0),
            review_budget_usd: Some(0.0),
            max_quality_fix_attempts: Some(2),
            max_issue_attempts: Some(3),
            max_ci_fix_attempts: Some(2),
            ci_check_timeout: Some(600),
            ci_poll_interval: Some(30),
            quality_gate_command: Some(vec!["make".into(), "quality".into()]),
            main_branch: Some("main".into()),
            worktree_base: None,
            repo_root: Some(PathBuf::from(".")),
            docker: Some(false),
            docker_image: None,
            docker_cpu_limit: Some(2.0),
            docker_memory_mb: Some(2048),
            docker_pids_limit: Some(512),
            docker_network: None,
            container_spawn_delay_secs: Some(2.0),
            git_user_name: None,
            git_user_email: None,
            poll_interval_secs: Some(15),
            session_cap: Some(50),
            quality_fix_rate_threshold: Some(0.5),
            approval_rate_threshold: Some(0.6),
            hitl_rate_threshold: Some(0.3),
            dry_run: Some(false),
            once: Some(false),
        }
    }
}
