//! `hydraflow` — the orchestrator binary. Resolves config (CLI flags over
//! `--config-file` JSON over built-in defaults), wires up logging and
//! graceful shutdown, and runs the five-phase pipeline until stopped.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hydra_core::{FileConfig, HydraConfig};
use hydra_orchestrator::Orchestrator;
use hydra_store::StateStore;
use hydra_worktree::WorktreeManager;
use tracing::info;

/// Runs the hydraflow issue pipeline against a GitHub repository.
///
/// Every flag here overlays `--config-file` (if given), which in turn
/// overlays the built-in defaults. Omit a flag to inherit from the layer
/// below it.
#[derive(Parser, Debug)]
#[command(name = "hydraflow", version, about)]
struct Cli {
    /// Path to a JSON config file, overlaid under these CLI flags.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Remove all worktrees and reset run state (preserving lifetime
    /// stats), then exit without running the pipeline.
    #[arg(long)]
    clean: bool,

    /// Emit structured JSON logs instead of human-readable ones.
    #[arg(long)]
    log_json: bool,

    #[arg(long)]
    repo: Option<String>,
    #[arg(long)]
    find_label: Option<String>,
    #[arg(long)]
    plan_label: Option<String>,
    #[arg(long)]
    ready_label: Option<String>,
    #[arg(long)]
    review_label: Option<String>,
    #[arg(long)]
    fixed_label: Option<String>,
    #[arg(long)]
    hitl_label: Option<String>,
    #[arg(long)]
    epic_label: Option<String>,
    #[arg(long)]
    dup_label: Option<String>,
    #[arg(long)]
    improve_label: Option<String>,

    #[arg(long)]
    batch_size: Option<u32>,
    #[arg(long)]
    max_workers: Option<usize>,
    #[arg(long)]
    max_planners: Option<usize>,
    #[arg(long)]
    max_reviewers: Option<usize>,
    #[arg(long)]
    max_hitl_workers: Option<usize>,

    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    review_model: Option<String>,
    #[arg(long)]
    max_budget_usd: Option<f64>,
    #[arg(long)]
    review_budget_usd: Option<f64>,

    #[arg(long)]
    max_quality_fix_attempts: Option<u32>,
    #[arg(long)]
    max_issue_attempts: Option<u32>,
    #[arg(long)]
    max_ci_fix_attempts: Option<u32>,
    #[arg(long)]
    ci_check_timeout: Option<u64>,
    #[arg(long)]
    ci_poll_interval: Option<u64>,

    /// Quality gate command, e.g. `--quality-gate-command make --quality-gate-command quality`.
    #[arg(long)]
    quality_gate_command: Vec<String>,
    #[arg(long)]
    main_branch: Option<String>,
    #[arg(long)]
    worktree_base: Option<PathBuf>,
    #[arg(long)]
    repo_root: Option<PathBuf>,

    #[arg(long)]
    docker: bool,
    #[arg(long)]
    docker_image: Option<String>,
    #[arg(long)]
    docker_cpu_limit: Option<f64>,
    #[arg(long)]
    docker_memory_mb: Option<u64>,
    #[arg(long)]
    docker_pids_limit: Option<i64>,
    #[arg(long)]
    docker_network: Option<String>,
    #[arg(long)]
    container_spawn_delay_secs: Option<f64>,

    #[arg(long)]
    git_user_name: Option<String>,
    #[arg(long)]
    git_user_email: Option<String>,

    #[arg(long)]
    poll_interval_secs: Option<u64>,
    #[arg(long)]
    session_cap: Option<usize>,
    #[arg(long)]
    quality_fix_rate_threshold: Option<f64>,
    #[arg(long)]
    approval_rate_threshold: Option<f64>,
    #[arg(long)]
    hitl_rate_threshold: Option<f64>,

    /// Build worktrees and run agents, but never push, open PRs, merge, or
    /// close issues.
    #[arg(long)]
    dry_run: bool,

    /// Run every phase loop for a single tick, then exit instead of
    /// polling forever.
    #[arg(long)]
    once: bool,
}

impl Cli {
    fn into_file_config(self) -> FileConfig {
        FileConfig {
            repo: self.repo,
            find_label: self.find_label,
            plan_label: self.plan_label,
            ready_label: self.ready_label,
            review_label: self.review_label,
            fixed_label: self.fixed_label,
            hitl_label: self.hitl_label,
            epic_label: self.epic_label,
            dup_label: self.dup_label,
            improve_label: self.improve_label,
            batch_size: self.batch_size,
            max_workers: self.max_workers,
            max_planners: self.max_planners,
            max_reviewers: self.max_reviewers,
            max_hitl_workers: self.max_hitl_workers,
            model: self.model,
            review_model: self.review_model,
            max_budget_usd: self.max_budget_usd,
            review_budget_usd: self.review_budget_usd,
            max_quality_fix_attempts: self.max_quality_fix_attempts,
            max_issue_attempts: self.max_issue_attempts,
            max_ci_fix_attempts: self.max_ci_fix_attempts,
            ci_check_timeout: self.ci_check_timeout,
            ci_poll_interval: self.ci_poll_interval,
            quality_gate_command: if self.quality_gate_command.is_empty() {
                None
            } else {
                Some(self.quality_gate_command)
            },
            main_branch: self.main_branch,
            worktree_base: self.worktree_base,
            repo_root: self.repo_root,
            docker: if self.docker { Some(true) } else { None },
            docker_image: self.docker_image,
            docker_cpu_limit: self.docker_cpu_limit,
            docker_memory_mb: self.docker_memory_mb,
            docker_pids_limit: self.docker_pids_limit,
            docker_network: self.docker_network,
            container_spawn_delay_secs: self.container_spawn_delay_secs,
            git_user_name: self.git_user_name,
            git_user_email: self.git_user_email,
            poll_interval_secs: self.poll_interval_secs,
            session_cap: self.session_cap,
            quality_fix_rate_threshold: self.quality_fix_rate_threshold,
            approval_rate_threshold: self.approval_rate_threshold,
            hitl_rate_threshold: self.hitl_rate_threshold,
            dry_run: if self.dry_run { Some(true) } else { None },
            once: if self.once { Some(true) } else { None },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.log_json {
        hydra_telemetry::init_logging_json("hydraflow", "info");
    } else {
        hydra_telemetry::init_logging("hydraflow", "info");
    }

    let config_file_path = cli.config_file.clone();
    let clean = cli.clean;

    let cli_overlay = cli.into_file_config();
    let file_overlay = match &config_file_path {
        Some(path) => FileConfig::load_from(path)
            .with_context(|| format!("failed to load config file {}", path.display()))?,
        None => FileConfig::default(),
    };
    let config = HydraConfig::from_overlay(cli_overlay.merge_over(file_overlay));

    if clean {
        return run_clean(&config).await;
    }

    let once = config.once;
    info!(repo = %config.repo, once, "starting hydraflow");

    let orchestrator = Arc::new(
        Orchestrator::new(config)
            .await
            .context("failed to construct orchestrator")?,
    );

    tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            #[cfg(unix)]
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };

            #[cfg(unix)]
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        tracing::error!(error = %e, "failed to listen for ctrl-c");
                        return;
                    }
                    info!("sigint received, shutting down");
                }
                _ = sigterm.recv() => {
                    info!("sigterm received, shutting down");
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                    return;
                }
                info!("ctrl-c received, shutting down");
            }

            orchestrator.request_stop();
        }
    });

    orchestrator.run(once).await;

    Ok(())
}

async fn run_clean(config: &HydraConfig) -> Result<()> {
    let identity = hydra_worktree::GitIdentity {
        name: config.git_user_name.clone(),
        email: config.git_user_email.clone(),
    };
    let worktree = WorktreeManager::new(
        config.repo_root.clone(),
        config.worktree_base.clone(),
        config.main_branch.clone(),
        identity,
        std::sync::Arc::new(hydra_worktree::RealGitRunner),
    );
    worktree
        .destroy_all()
        .await
        .context("failed to remove worktrees")?;

    let mut state = StateStore::new(config.state_file());
    state.reset();
    info!("removed all worktrees and reset run state");
    Ok(())
}
