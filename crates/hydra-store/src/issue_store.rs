//! In-memory, thread-safe registry of issues by lifecycle stage — the
//! authoritative answer to "what is each phase allowed to pick up?"
//!
//! A single `tokio::sync::Mutex` guards the whole table rather than a
//! lock-free map: the invariant "at most one phase holds a given issue
//! active" needs one atomic critical section across the whole record,
//! which a sharded map would not give for free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hydra_core::{Issue, LifecycleStage, ShutdownSignal};
use tokio::sync::Mutex;
use tracing::warn;

/// Supplies the current set of issues eligible for each phase. Implemented
/// by the GitHub-backed fetcher in `hydra-github`; faked in tests.
#[async_trait]
pub trait IssueFetcher: Send + Sync {
    async fn fetch_for_stage(&self, stage: LifecycleStage) -> anyhow::Result<Vec<Issue>>;
}

struct Record {
    issue: Issue,
    stage: LifecycleStage,
    active_phase: Option<LifecycleStage>,
    last_seen: Instant,
}

#[derive(Default)]
struct Table {
    records: HashMap<u64, Record>,
}

#[derive(Clone)]
pub struct IssueStore {
    inner: Arc<Mutex<Table>>,
}

impl IssueStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Table::default())),
        }
    }

    /// Replace (or insert) the tracked stage for a batch of issues, as
    /// reported by a fetch for a given `stage`. An issue that is currently
    /// `active_phase`-locked keeps its lock; only its label-derived stage
    /// and `last_seen` are refreshed.
    pub async fn refresh_stage(&self, stage: LifecycleStage, issues: Vec<Issue>) {
        let mut table = self.inner.lock().await;
        for issue in issues {
            let entry = table.records.entry(issue.number).or_insert_with(|| Record {
                issue: issue.clone(),
                stage,
                active_phase: None,
                last_seen: Instant::now(),
            });
            entry.issue = issue;
            entry.stage = stage;
            entry.last_seen = Instant::now();
        }
    }

    async fn get_stageable(&self, stage: LifecycleStage, max_count: usize) -> Vec<Issue> {
        let table = self.inner.lock().await;
        table
            .records
            .values()
            .filter(|r| r.stage == stage && r.active_phase.is_none())
            .take(max_count)
            .map(|r| r.issue.clone())
            .collect()
    }

    pub async fn get_triageable(&self, max_count: usize) -> Vec<Issue> {
        self.get_stageable(LifecycleStage::Triage, max_count).await
    }

    pub async fn get_plannable(&self, max_count: usize) -> Vec<Issue> {
        self.get_stageable(LifecycleStage::Plan, max_count).await
    }

    pub async fn get_implementable(&self, max_count: usize) -> Vec<Issue> {
        self.get_stageable(LifecycleStage::Implement, max_count).await
    }

    pub async fn get_reviewable(&self, max_count: usize) -> Vec<Issue> {
        self.get_stageable(LifecycleStage::Review, max_count).await
    }

    /// Atomically claim an issue for `phase`. Idempotent: claiming an
    /// issue already held by the same phase is a no-op success.
    pub async fn mark_active(&self, issue_number: u64, phase: LifecycleStage) {
        let mut table = self.inner.lock().await;
        if let Some(record) = table.records.get_mut(&issue_number) {
            record.active_phase = Some(phase);
        }
    }

    pub async fn mark_complete(&self, issue_number: u64) {
        let mut table = self.inner.lock().await;
        if let Some(record) = table.records.get_mut(&issue_number) {
            record.active_phase = None;
        }
    }

    pub async fn is_active(&self, issue_number: u64) -> bool {
        let table = self.inner.lock().await;
        table
            .records
            .get(&issue_number)
            .map(|r| r.active_phase.is_some())
            .unwrap_or(false)
    }

    pub async fn get_active_issues(&self) -> HashMap<u64, LifecycleStage> {
        let table = self.inner.lock().await;
        table
            .records
            .iter()
            .filter_map(|(n, r)| r.active_phase.map(|p| (*n, p)))
            .collect()
    }

    /// Moves an issue to a new stage after a phase transition (e.g.
    /// implement success -> review) without touching its active-phase
    /// lock; callers still own the `mark_active`/`mark_complete` envelope.
    pub async fn set_stage(&self, issue_number: u64, stage: LifecycleStage) {
        let mut table = self.inner.lock().await;
        if let Some(record) = table.records.get_mut(&issue_number) {
            record.stage = stage;
        }
    }

    pub async fn remove(&self, issue_number: u64) {
        let mut table = self.inner.lock().await;
        table.records.remove(&issue_number);
    }

    /// Spawns a background task that refreshes every lifecycle stage from
    /// `fetcher` on a fixed interval until `stop_signal` fires. A fetch
    /// failure is logged and skipped rather than retried immediately, so a
    /// flaky upstream doesn't spin the loop.
    pub fn start(
        &self,
        fetcher: Arc<dyn IssueFetcher>,
        poll_interval: std::time::Duration,
        stop_signal: ShutdownSignal,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            let mut stop_rx = stop_signal.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for stage in LifecycleStage::ALL {
                            match fetcher.fetch_for_stage(stage).await {
                                Ok(issues) => store.refresh_stage(stage, issues).await,
                                Err(err) => warn!(stage = ?stage, error = %err, "issue refresh failed"),
                            }
                        }
                    }
                    _ = stop_rx.recv() => {
                        stop_signal.confirm_drained();
                        return;
                    }
                }
            }
        })
    }
}

impl Default for IssueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn issue(n: u64) -> Issue {
        Issue {
            number: n,
            title: format!("issue {n}"),
            body: String::new(),
            labels: BTreeSet::new(),
            comments: vec![],
            url: String::new(),
        }
    }

    #[tokio::test]
    async fn active_issue_is_excluded_from_getstageable() {
        let store = IssueStore::new();
        store
            .refresh_stage(LifecycleStage::Implement, vec![issue(1), issue(2)])
            .await;
        store.mark_active(1, LifecycleStage::Implement).await;

        let implementable = store.get_implementable(10).await;
        assert_eq!(implementable.len(), 1);
        assert_eq!(implementable[0].number, 2);
    }

    #[tokio::test]
    async fn mark_complete_makes_issue_pickable_again() {
        let store = IssueStore::new();
        store.refresh_stage(LifecycleStage::Review, vec![issue(5)]).await;
        store.mark_active(5, LifecycleStage::Review).await;
        assert!(store.get_reviewable(10).await.is_empty());
        store.mark_complete(5).await;
        assert_eq!(store.get_reviewable(10).await.len(), 1);
    }

    #[tokio::test]
    async fn no_issue_appears_in_two_stage_queries_at_once() {
        let store = IssueStore::new();
        store.refresh_stage(LifecycleStage::Implement, vec![issue(1)]).await;
        let implementable = store.get_implementable(10).await;
        let reviewable = store.get_reviewable(10).await;
        assert!(implementable.iter().all(|i| !reviewable.iter().any(|j| j.number == i.number)));
    }
}
