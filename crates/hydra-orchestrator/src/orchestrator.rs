//! Top-level supervisor: wires every collaborator together, runs the five
//! phase loops as independent tasks, and implements the stop protocol.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use hydra_core::events::OrchestratorStatusEvent;
use hydra_core::HydraEvent;
use hydra_executor::container::ContainerLimits;
use hydra_github::{GitHubClient, GitHubIssueFetcher, StageLabels};
use hydra_store::{IssueFetcher, IssueStore, StateStore};
use hydra_worktree::{GitIdentity, RealGitRunner, WorktreeManager};

use crate::error::OrchestratorError;
use crate::shared::Shared;
use crate::status::RunStatus;

/// Falls back to a pinned agent image when `HydraConfig.docker_image` is
/// unset but `docker` is enabled — the config schema leaves the tag
/// optional, but `ContainerLimits::image` has no default of its own.
const DEFAULT_CONTAINER_IMAGE: &str = "ghcr.io/anthropics/claude-code:latest";

pub struct Orchestrator {
    shared: Arc<Shared>,
    fetcher: Arc<dyn IssueFetcher>,
}

impl Orchestrator {
    pub async fn new(config: hydra_core::HydraConfig) -> Result<Self, OrchestratorError> {
        let github = GitHubClient::from_env(&config.repo)?;

        let labels = StageLabels {
            triage: config.find_label.clone(),
            plan: config.plan_label.clone(),
            implement: config.ready_label.clone(),
            review: config.review_label.clone(),
            hitl: config.hitl_label.clone(),
        };
        let fetcher: Arc<dyn IssueFetcher> =
            Arc::new(GitHubIssueFetcher::new(github.clone(), labels));

        let state = StateStore::new(config.state_file());

        let identity = GitIdentity {
            name: config.git_user_name.clone(),
            email: config.git_user_email.clone(),
        };
        let worktree = WorktreeManager::new(
            config.repo_root.clone(),
            config.worktree_base.clone(),
            config.main_branch.clone(),
            identity,
            Arc::new(RealGitRunner),
        );

        let limits = if config.docker {
            Some(ContainerLimits {
                image: config
                    .docker_image
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CONTAINER_IMAGE.to_string()),
                cpu_limit: config.docker_cpu_limit,
                memory_mb: config.docker_memory_mb,
                pids_limit: config.docker_pids_limit,
                network_mode: config.docker_network.clone(),
                tmp_size_mb: 4096,
                repo_root: config.repo_root.clone(),
                logs_dir: config.state_dir().join("logs"),
                spawn_delay: Duration::from_secs_f64(config.container_spawn_delay_secs),
            })
        } else {
            None
        };
        let executor = hydra_executor::build_executor(limits).await;

        let issue_store = IssueStore::new();
        let shared = Arc::new(Shared::new(config, github, issue_store, state, worktree, executor));

        Ok(Self { shared, fetcher })
    }

    /// Runs the orchestrator to completion. With `once: true`, each phase
    /// loop runs a single fetch/dispatch tick and exits; otherwise loops
    /// until `request_stop`/`stop` is called (typically from a signal
    /// handler in the binary).
    pub async fn run(&self, once: bool) {
        self.shared.set_running(true);
        self.publish_status("running");

        {
            let state = self.shared.state.lock().await;
            let recovered: HashSet<u64> = state.get_active_issue_numbers().iter().copied().collect();
            drop(state);
            *self.shared.recovered_issues.lock().await = recovered;
        }

        let poll_handle = self.shared.issue_store.start(
            self.fetcher.clone(),
            Duration::from_secs(self.shared.config.poll_interval_secs),
            self.shared.shutdown.clone(),
        );

        let mut set = tokio::task::JoinSet::new();
        set.spawn(crate::triage_loop::run(self.shared.clone(), once));
        set.spawn(crate::plan_loop::run(self.shared.clone(), once));
        set.spawn(crate::implement_loop::run(self.shared.clone(), once));
        set.spawn(crate::review_loop::run(self.shared.clone(), once));
        set.spawn(crate::hitl_loop::run(self.shared.clone(), once));

        while let Some(result) = set.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "phase loop task panicked");
                }
            }
        }

        poll_handle.abort();
        self.terminate().await;

        {
            let active: Vec<u64> = self
                .shared
                .issue_store
                .get_active_issues()
                .await
                .keys()
                .copied()
                .collect();
            let mut state = self.shared.state.lock().await;
            state.set_active_issue_numbers(active);
        }

        self.publish_status("idle");
        self.shared.set_running(false);
    }

    /// Signals every loop to stop dispatching new work; already-running
    /// work is left to drain on its own unless `stop()` is also called.
    pub fn request_stop(&self) {
        self.shared.shutdown.trigger();
    }

    /// Signals shutdown and eagerly aborts every in-flight phase task
    /// instead of waiting for it to finish on its own.
    pub async fn stop(&self) {
        self.shared.shutdown.trigger();
        self.publish_status("stopping");
        self.terminate().await;
    }

    async fn terminate(&self) {
        let mut handles = self.shared.active_handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        drop(handles);
        self.shared.executor.cleanup().await;
    }

    pub fn run_status(&self) -> RunStatus {
        crate::status::resolve(
            self.shared.is_fatal(),
            self.shared.is_running(),
            self.shared.shutdown.is_shutting_down(),
        )
    }

    pub fn event_bus(&self) -> &hydra_bus::EventBus {
        &self.shared.bus
    }

    fn publish_status(&self, status: &str) {
        self.shared.publish(HydraEvent::OrchestratorStatus(OrchestratorStatusEvent {
            status: status.to_string(),
        }));
    }
}

