//! Collaborators shared by every phase loop, bundled behind a single `Arc`
//! so loop tasks can be spawned independently without threading a dozen
//! separate handles through each function signature.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hydra_core::{Envelope, HydraConfig, HydraEvent, ShutdownSignal};
use hydra_executor::executor::Executor;
use hydra_executor::stream_reader::{LiveProcessSet, StreamReaderConfig};
use hydra_github::GitHubClient;
use hydra_store::{IssueStore, StateStore};
use hydra_worktree::WorktreeManager;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

/// Marker appended to every HITL escalation comment so the HITL loop can
/// tell a bot-authored escalation notice apart from a genuine follow-up
/// correction left by a human.
pub const ESCALATION_MARKER: &str = "<!-- hydraflow:hitl-escalation -->";

pub struct Shared {
    pub config: HydraConfig,
    pub github: GitHubClient,
    pub issue_store: IssueStore,
    pub state: Mutex<StateStore>,
    pub worktree: WorktreeManager,
    pub bus: hydra_bus::EventBus,
    pub executor: Arc<dyn Executor>,
    pub shutdown: ShutdownSignal,
    pub live: LiveProcessSet,
    pub stream_config: StreamReaderConfig,
    pub recovered_issues: Mutex<HashSet<u64>>,
    pub active_handles: Mutex<Vec<AbortHandle>>,
    running: AtomicBool,
    fatal: AtomicBool,
}

impl Shared {
    pub fn new(
        config: HydraConfig,
        github: GitHubClient,
        issue_store: IssueStore,
        state: StateStore,
        worktree: WorktreeManager,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            config,
            github,
            issue_store,
            state: Mutex::new(state),
            worktree,
            bus: hydra_bus::EventBus::new(),
            executor,
            shutdown: ShutdownSignal::new(),
            live: LiveProcessSet::default(),
            stream_config: StreamReaderConfig::default(),
            recovered_issues: Mutex::new(HashSet::new()),
            active_handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        }
    }

    pub fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Marks the run as fatally broken (agent authentication/credit
    /// failure), publishes an alert, and triggers shutdown. Idempotent.
    pub fn trigger_fatal(&self, message: &str) {
        self.fatal.store(true, Ordering::SeqCst);
        self.publish(HydraEvent::SystemAlert(hydra_core::events::SystemAlertEvent {
            message: message.to_string(),
            fatal: true,
        }));
        self.shutdown.trigger();
    }

    pub fn publish(&self, event: HydraEvent) {
        self.bus.publish(Envelope::new(event));
    }

    pub fn publish_error(&self, scope: &str, message: &str) {
        tracing::warn!(scope, message, "phase loop error");
        self.publish(HydraEvent::Error(hydra_core::events::ErrorEvent {
            scope: scope.to_string(),
            message: message.to_string(),
        }));
    }
}
