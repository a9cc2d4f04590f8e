//! Core data model shared across every HydraFlow crate.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A GitHub issue as fetched from the tracker. Immutable once constructed —
/// callers that need updated labels re-fetch rather than mutate in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: BTreeSet<String>,
    pub comments: Vec<String>,
    pub url: String,
}

impl Issue {
    /// The deterministic branch name for an issue: `agent/issue-<N>`.
    pub fn branch_name(&self) -> String {
        branch_name_for(self.number)
    }
}

/// Deterministic branch-name function, exposed standalone so callers that
/// only have an issue number (not a full `Issue`) can compute it too.
pub fn branch_name_for(issue_number: u64) -> String {
    format!("agent/issue-{issue_number}")
}

/// Outcome of one implementer run against an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub issue_number: u64,
    pub branch: String,
    pub success: bool,
    pub transcript: String,
    pub commits: u32,
    pub worktree_path: Option<String>,
    pub duration_seconds: f64,
    pub error: Option<String>,
    pub quality_fix_attempts: u32,
    pub pr_info: Option<PrInfo>,
}

impl WorkerResult {
    pub fn failed(issue_number: u64, branch: String, error: impl Into<String>) -> Self {
        Self {
            issue_number,
            branch,
            success: false,
            transcript: String::new(),
            commits: 0,
            worktree_path: None,
            duration_seconds: 0.0,
            error: Some(error.into()),
            quality_fix_attempts: 0,
            pr_info: None,
        }
    }

    /// True for the specific "nothing to do" shape the orchestrator treats
    /// as already-satisfied rather than a real failure.
    pub fn is_zero_commit_already_satisfied(&self) -> bool {
        !self.success
            && self.commits == 0
            && self.error.as_deref() == Some("No commits found on branch")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub issue_number: u64,
    pub branch: String,
    pub url: String,
    pub draft: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve,
    RequestChanges,
    Comment,
}

impl ReviewVerdict {
    pub fn as_state_str(&self) -> &'static str {
        match self {
            ReviewVerdict::Approve => "approve",
            ReviewVerdict::RequestChanges => "request_changes",
            ReviewVerdict::Comment => "comment",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub pr_number: u64,
    pub issue_number: u64,
    pub verdict: ReviewVerdict,
    pub summary: String,
    pub fixes_made: bool,
    pub transcript: String,
    pub merged: bool,
    pub ci_passed: bool,
    pub ci_fix_attempts: u32,
    pub duration_seconds: f64,
}

impl ReviewResult {
    pub fn new(pr_number: u64, issue_number: u64) -> Self {
        Self {
            pr_number,
            issue_number,
            verdict: ReviewVerdict::Comment,
            summary: String::new(),
            fixes_made: false,
            transcript: String::new(),
            merged: false,
            ci_passed: false,
            ci_fix_attempts: 0,
            duration_seconds: 0.0,
        }
    }
}

/// Phase tag used by the IssueStore to grant mutual exclusion over an
/// issue: at most one phase may hold an issue "active" at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Triage,
    Plan,
    Implement,
    Review,
    Hitl,
}

impl LifecycleStage {
    pub const ALL: [LifecycleStage; 5] = [
        LifecycleStage::Triage,
        LifecycleStage::Plan,
        LifecycleStage::Implement,
        LifecycleStage::Review,
        LifecycleStage::Hitl,
    ];
}

/// Sub-state reported within a WORKER_UPDATE event, mirroring the implement
/// side's status progression (running -> testing -> quality_fix -> done).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Testing,
    QualityFix,
    Done,
    Failed,
}

/// Sub-state reported within a REVIEW_UPDATE / CI_CHECK event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerStatus {
    Start,
    MergeMain,
    ConflictResolution,
    Reviewing,
    CiWait,
    CiFix,
    FixDone,
    Merging,
    Escalating,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLog {
    pub id: String,
    pub repo: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub issues_processed: Vec<u64>,
    pub issues_succeeded: u32,
    pub issues_failed: u32,
    pub status: SessionStatus,
}

/// Per-run replay manifest written under `runs/<N>/<UTC_TS>/manifest.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub issue_number: u64,
    pub timestamp: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub duration_seconds: f64,
    pub files: Vec<String>,
}
