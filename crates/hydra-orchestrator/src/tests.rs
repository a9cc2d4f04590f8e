use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hydra_core::shutdown::ShutdownSignal;
use hydra_executor::HostExecutor;
use hydra_github::GitHubClient;
use hydra_store::StateStore;
use hydra_worktree::{GitIdentity, RealGitRunner, WorktreeManager};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::batch::run_batch;
use crate::shared::Shared;

fn dummy_shared(tmp: &std::path::Path) -> Arc<Shared> {
    let config = hydra_core::HydraConfig::from_overlay(hydra_core::FileConfig {
        repo: Some("owner/repo".into()),
        repo_root: Some(tmp.to_path_buf()),
        ..Default::default()
    });
    let github = GitHubClient::new("fake-token", "owner", "repo").expect("client");
    let state = StateStore::new(tmp.join("state.json"));
    let worktree = WorktreeManager::new(
        tmp.to_path_buf(),
        tmp.join("worktrees"),
        "main",
        GitIdentity::default(),
        Arc::new(RealGitRunner),
    );
    let executor = Arc::new(HostExecutor::new());
    Arc::new(Shared::new(
        config,
        github,
        hydra_store::IssueStore::new(),
        state,
        worktree,
        executor,
    ))
}

#[tokio::test]
async fn run_batch_respects_concurrency_cap() {
    let shutdown = ShutdownSignal::new();
    let handles: Mutex<Vec<AbortHandle>> = Mutex::new(Vec::new());
    let current = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let items: Vec<u32> = (0..10).collect();
    let current2 = current.clone();
    let max_seen2 = max_seen.clone();
    run_batch(items, 3, &shutdown, &handles, move |_item: u32| {
        let current = current2.clone();
        let max_seen = max_seen2.clone();
        async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            current.fetch_sub(1, Ordering::SeqCst);
        }
    })
    .await;

    assert!(max_seen.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn run_batch_stops_dispatching_after_shutdown() {
    let shutdown = ShutdownSignal::new();
    let handles: Mutex<Vec<AbortHandle>> = Mutex::new(Vec::new());
    let ran = Arc::new(AtomicUsize::new(0));

    shutdown.trigger();

    let items: Vec<u32> = (0..5).collect();
    let ran2 = ran.clone();
    run_batch(items, 2, &shutdown, &handles, move |_item: u32| {
        let ran = ran2.clone();
        async move {
            ran.fetch_add(1, Ordering::SeqCst);
        }
    })
    .await;

    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn trigger_fatal_sets_status_and_shuts_down() {
    let tmp = tempfile::tempdir().unwrap();
    let shared = dummy_shared(tmp.path());

    assert!(!shared.is_fatal());
    shared.trigger_fatal("agent authentication failed");
    assert!(shared.is_fatal());
    assert!(shared.shutdown.is_shutting_down());
}

#[test]
fn status_precedence_follows_fixed_order() {
    use crate::status::{resolve, RunStatus};
    assert_eq!(resolve(true, true, true), RunStatus::AuthFailed);
    assert_eq!(resolve(false, true, true), RunStatus::Stopping);
    assert_eq!(resolve(false, true, false), RunStatus::Running);
    assert_eq!(resolve(false, false, false), RunStatus::Idle);
}
