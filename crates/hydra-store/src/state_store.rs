//! Crash-recoverable, atomically-persisted state. Every save writes to a
//! tempfile in the same directory, fsyncs it, then renames it over the
//! final path so a crash mid-write never leaves a partial file behind.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("failed to create state directory {0}: {1}")]
    CreateDir(PathBuf, #[source] std::io::Error),
    #[error("failed to write state file {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifetimeStats {
    pub issues_completed: u64,
    pub prs_merged: u64,
    pub total_quality_fix_rounds: u64,
    pub total_ci_fix_rounds: u64,
    pub total_hitl_escalations: u64,
    pub total_review_approvals: u64,
    pub total_review_request_changes: u64,
    pub total_reviewer_fixes: u64,
    pub total_implementation_seconds: f64,
    pub total_review_seconds: f64,
    pub total_reviews: u64,
    pub fired_thresholds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdProposal {
    pub name: String,
    pub metric: String,
    pub threshold: f64,
    pub value: f64,
    pub action: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateData {
    pub processed_issues: BTreeMap<u64, String>,
    pub active_worktrees: BTreeMap<u64, String>,
    pub active_branches: BTreeMap<u64, String>,
    pub reviewed_prs: BTreeMap<u64, String>,
    pub hitl_origins: BTreeMap<u64, String>,
    pub hitl_causes: BTreeMap<u64, String>,
    pub review_attempts: BTreeMap<u64, u32>,
    pub review_feedback: BTreeMap<u64, String>,
    pub issue_attempts: BTreeMap<u64, u32>,
    pub active_issue_numbers: Vec<u64>,
    pub worker_result_meta: BTreeMap<u64, serde_json::Value>,
    pub current_batch: u64,
    pub lifetime_stats: LifetimeStats,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Atomic on-disk JSON store. Single-writer within the process: every
/// mutator saves synchronously, so load-before-mutate is never required.
pub struct StateStore {
    path: PathBuf,
    data: StateData,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = Self::load_from_disk(&path);
        Self { path, data }
    }

    fn load_from_disk(path: &Path) -> StateData {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "corrupt state file, resetting to defaults");
                    StateData::default()
                }
            },
            Err(_) => StateData::default(),
        }
    }

    fn save(&mut self) -> Result<(), StateStoreError> {
        self.data.last_updated = Some(Utc::now());
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)
            .map_err(|e| StateStoreError::CreateDir(parent.clone(), e))?;

        let json = serde_json::to_string_pretty(&self.data)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".state-")
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(|e| StateStoreError::Write(self.path.clone(), e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| StateStoreError::Write(self.path.clone(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StateStoreError::Write(self.path.clone(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| StateStoreError::Write(self.path.clone(), e.error))?;
        Ok(())
    }

    pub fn data(&self) -> &StateData {
        &self.data
    }

    // --- issue status ---

    pub fn mark_issue(&mut self, issue_number: u64, status: impl Into<String>) {
        self.data.processed_issues.insert(issue_number, status.into());
        let _ = self.save();
    }

    /// True only for status == "success" — failed issues are retried.
    pub fn is_processed(&self, issue_number: u64) -> bool {
        self.data
            .processed_issues
            .get(&issue_number)
            .map(|s| s == "success")
            .unwrap_or(false)
    }

    pub fn get_issue_status(&self, issue_number: u64) -> Option<&str> {
        self.data.processed_issues.get(&issue_number).map(String::as_str)
    }

    // --- worktrees / branches ---

    pub fn active_worktrees(&self) -> &BTreeMap<u64, String> {
        &self.data.active_worktrees
    }

    pub fn set_worktree(&mut self, issue_number: u64, path: impl Into<String>) {
        self.data.active_worktrees.insert(issue_number, path.into());
        let _ = self.save();
    }

    pub fn remove_worktree(&mut self, issue_number: u64) {
        self.data.active_worktrees.remove(&issue_number);
        let _ = self.save();
    }

    pub fn set_branch(&mut self, issue_number: u64, branch: impl Into<String>) {
        self.data.active_branches.insert(issue_number, branch.into());
        let _ = self.save();
    }

    pub fn get_branch(&self, issue_number: u64) -> Option<&str> {
        self.data.active_branches.get(&issue_number).map(String::as_str)
    }

    // --- PR review verdicts ---

    pub fn mark_pr(&mut self, pr_number: u64, status: impl Into<String>) {
        self.data.reviewed_prs.insert(pr_number, status.into());
        let _ = self.save();
    }

    pub fn get_pr_status(&self, pr_number: u64) -> Option<&str> {
        self.data.reviewed_prs.get(&pr_number).map(String::as_str)
    }

    // --- HITL origin / cause ---

    pub fn set_hitl_origin(&mut self, issue_number: u64, label: impl Into<String>) {
        self.data.hitl_origins.insert(issue_number, label.into());
        let _ = self.save();
    }

    pub fn get_hitl_origin(&self, issue_number: u64) -> Option<&str> {
        self.data.hitl_origins.get(&issue_number).map(String::as_str)
    }

    pub fn remove_hitl_origin(&mut self, issue_number: u64) {
        self.data.hitl_origins.remove(&issue_number);
        let _ = self.save();
    }

    pub fn set_hitl_cause(&mut self, issue_number: u64, cause: impl Into<String>) {
        self.data.hitl_causes.insert(issue_number, cause.into());
        let _ = self.save();
    }

    pub fn get_hitl_cause(&self, issue_number: u64) -> Option<&str> {
        self.data.hitl_causes.get(&issue_number).map(String::as_str)
    }

    pub fn remove_hitl_cause(&mut self, issue_number: u64) {
        self.data.hitl_causes.remove(&issue_number);
        let _ = self.save();
    }

    // --- review attempts / feedback ---

    pub fn get_review_attempts(&self, issue_number: u64) -> u32 {
        *self.data.review_attempts.get(&issue_number).unwrap_or(&0)
    }

    pub fn increment_review_attempts(&mut self, issue_number: u64) -> u32 {
        let entry = self.data.review_attempts.entry(issue_number).or_insert(0);
        *entry += 1;
        let value = *entry;
        let _ = self.save();
        value
    }

    pub fn reset_review_attempts(&mut self, issue_number: u64) {
        self.data.review_attempts.remove(&issue_number);
        let _ = self.save();
    }

    pub fn set_review_feedback(&mut self, issue_number: u64, text: impl Into<String>) {
        self.data.review_feedback.insert(issue_number, text.into());
        let _ = self.save();
    }

    pub fn get_review_feedback(&self, issue_number: u64) -> Option<&str> {
        self.data.review_feedback.get(&issue_number).map(String::as_str)
    }

    pub fn clear_review_feedback(&mut self, issue_number: u64) {
        self.data.review_feedback.remove(&issue_number);
        let _ = self.save();
    }

    // --- issue attempts (attempt cap) ---

    pub fn get_issue_attempts(&self, issue_number: u64) -> u32 {
        *self.data.issue_attempts.get(&issue_number).unwrap_or(&0)
    }

    pub fn increment_issue_attempts(&mut self, issue_number: u64) -> u32 {
        let entry = self.data.issue_attempts.entry(issue_number).or_insert(0);
        *entry += 1;
        let value = *entry;
        let _ = self.save();
        value
    }

    pub fn reset_issue_attempts(&mut self, issue_number: u64) {
        self.data.issue_attempts.remove(&issue_number);
        let _ = self.save();
    }

    // --- active issue numbers (crash recovery) ---

    pub fn get_active_issue_numbers(&self) -> &[u64] {
        &self.data.active_issue_numbers
    }

    pub fn set_active_issue_numbers(&mut self, numbers: Vec<u64>) {
        self.data.active_issue_numbers = numbers;
        let _ = self.save();
    }

    // --- worker result metadata ---

    pub fn set_worker_result_meta(&mut self, issue_number: u64, meta: serde_json::Value) {
        self.data.worker_result_meta.insert(issue_number, meta);
        let _ = self.save();
    }

    pub fn get_worker_result_meta(&self, issue_number: u64) -> serde_json::Value {
        self.data
            .worker_result_meta
            .get(&issue_number)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }

    // --- batch counter ---

    pub fn current_batch(&self) -> u64 {
        self.data.current_batch
    }

    pub fn increment_batch(&mut self) -> u64 {
        self.data.current_batch += 1;
        let value = self.data.current_batch;
        let _ = self.save();
        value
    }

    /// Clears everything except lifetime stats (and its fired-threshold
    /// set), which are deliberately preserved across a `--clean` run.
    pub fn reset(&mut self) {
        let preserved = self.data.lifetime_stats.clone();
        self.data = StateData {
            lifetime_stats: preserved,
            ..StateData::default()
        };
        let _ = self.save();
    }

    // --- lifetime stats recorders ---

    pub fn record_issue_completed(&mut self) {
        self.data.lifetime_stats.issues_completed += 1;
        let _ = self.save();
    }

    pub fn record_pr_merged(&mut self) {
        self.data.lifetime_stats.prs_merged += 1;
        let _ = self.save();
    }

    pub fn record_quality_fix_rounds(&mut self, count: u64) {
        self.data.lifetime_stats.total_quality_fix_rounds += count;
        let _ = self.save();
    }

    pub fn record_ci_fix_rounds(&mut self, count: u64) {
        self.data.lifetime_stats.total_ci_fix_rounds += count;
        let _ = self.save();
    }

    pub fn record_hitl_escalation(&mut self) {
        self.data.lifetime_stats.total_hitl_escalations += 1;
        let _ = self.save();
    }

    pub fn record_review_verdict(&mut self, verdict: &str, fixes_made: bool) {
        self.data.lifetime_stats.total_reviews += 1;
        match verdict {
            "approve" => self.data.lifetime_stats.total_review_approvals += 1,
            "request_changes" => self.data.lifetime_stats.total_review_request_changes += 1,
            _ => {}
        }
        if fixes_made {
            self.data.lifetime_stats.total_reviewer_fixes += 1;
        }
        let _ = self.save();
    }

    pub fn record_implementation_duration(&mut self, seconds: f64) {
        self.data.lifetime_stats.total_implementation_seconds += seconds;
        let _ = self.save();
    }

    pub fn record_review_duration(&mut self, seconds: f64) {
        self.data.lifetime_stats.total_review_seconds += seconds;
        let _ = self.save();
    }

    pub fn lifetime_stats(&self) -> &LifetimeStats {
        &self.data.lifetime_stats
    }

    // --- fired thresholds ---

    pub fn fired_thresholds(&self) -> &[String] {
        &self.data.lifetime_stats.fired_thresholds
    }

    pub fn mark_threshold_fired(&mut self, name: &str) {
        if !self.data.lifetime_stats.fired_thresholds.iter().any(|n| n == name) {
            self.data.lifetime_stats.fired_thresholds.push(name.to_string());
            let _ = self.save();
        }
    }

    pub fn clear_threshold_fired(&mut self, name: &str) {
        let before = self.data.lifetime_stats.fired_thresholds.len();
        self.data.lifetime_stats.fired_thresholds.retain(|n| n != name);
        if self.data.lifetime_stats.fired_thresholds.len() != before {
            let _ = self.save();
        }
    }

    /// Returns newly-crossed thresholds that haven't already fired, and
    /// clears the fired flag for any metric that has since recovered.
    /// Requires a minimum sample size of 5 before a threshold can fire.
    pub fn check_thresholds(
        &mut self,
        quality_fix_rate_threshold: f64,
        approval_rate_threshold: f64,
        hitl_rate_threshold: f64,
    ) -> Vec<ThresholdProposal> {
        const MIN_SAMPLES: u64 = 5;
        let stats = self.data.lifetime_stats.clone();
        let mut proposals = Vec::new();

        let qf_rate = if stats.issues_completed > 0 {
            stats.total_quality_fix_rounds as f64 / stats.issues_completed as f64
        } else {
            0.0
        };
        self.evaluate_threshold(
            "quality_fix_rate",
            qf_rate > quality_fix_rate_threshold && stats.issues_completed >= MIN_SAMPLES,
            "quality fix rate",
            quality_fix_rate_threshold,
            qf_rate,
            "Review implementation prompts — too many quality fixes needed",
            &mut proposals,
        );

        let approval_rate = if stats.total_reviews > 0 {
            stats.total_review_approvals as f64 / stats.total_reviews as f64
        } else {
            1.0
        };
        self.evaluate_threshold(
            "approval_rate",
            approval_rate < approval_rate_threshold && stats.total_reviews >= MIN_SAMPLES,
            "approval rate",
            approval_rate_threshold,
            approval_rate,
            "Review code quality — approval rate is below threshold",
            &mut proposals,
        );

        let hitl_rate = if stats.issues_completed > 0 {
            stats.total_hitl_escalations as f64 / stats.issues_completed as f64
        } else {
            0.0
        };
        self.evaluate_threshold(
            "hitl_rate",
            hitl_rate > hitl_rate_threshold && stats.issues_completed >= MIN_SAMPLES,
            "HITL escalation rate",
            hitl_rate_threshold,
            hitl_rate,
            "Investigate HITL escalation causes — too many issues need human intervention",
            &mut proposals,
        );

        proposals
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_threshold(
        &mut self,
        name: &str,
        crossed: bool,
        metric: &str,
        threshold: f64,
        value: f64,
        action: &str,
        proposals: &mut Vec<ThresholdProposal>,
    ) {
        let already_fired = self
            .data
            .lifetime_stats
            .fired_thresholds
            .iter()
            .any(|n| n == name);
        if crossed {
            if !already_fired {
                self.mark_threshold_fired(name);
                proposals.push(ThresholdProposal {
                    name: name.to_string(),
                    metric: metric.to_string(),
                    threshold,
                    value,
                    action: action.to_string(),
                });
            }
        } else if already_fired {
            self.clear_threshold_fired(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join("state.json"))
    }

    #[test]
    fn is_processed_true_only_for_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(&dir);
        s.mark_issue(1, "failed");
        assert!(!s.is_processed(1));
        s.mark_issue(1, "success");
        assert!(s.is_processed(1));
    }

    #[test]
    fn save_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let mut s = StateStore::new(&path);
            s.mark_issue(7, "success");
            s.set_branch(7, "agent/issue-7");
        }
        let reloaded = StateStore::new(&path);
        assert!(reloaded.is_processed(7));
        assert_eq!(reloaded.get_branch(7), Some("agent/issue-7"));
    }

    #[test]
    fn corrupt_file_resets_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").unwrap();
        let s = StateStore::new(&path);
        assert_eq!(s.current_batch(), 0);
    }

    #[test]
    fn reset_preserves_lifetime_stats() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(&dir);
        s.mark_issue(1, "success");
        s.record_issue_completed();
        s.reset();
        assert!(!s.is_processed(1));
        assert_eq!(s.lifetime_stats().issues_completed, 1);
    }

    #[test]
    fn threshold_fires_only_after_minimum_sample_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(&dir);
        for _ in 0..4 {
            s.record_issue_completed();
        }
        s.record_quality_fix_rounds(10); // rate 2.5, well above any threshold
        let proposals = s.check_thresholds(0.5, 0.6, 0.3);
        assert!(proposals.is_empty(), "should not fire below 5 samples");

        s.record_issue_completed();
        let proposals = s.check_thresholds(0.5, 0.6, 0.3);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].name, "quality_fix_rate");
    }

    #[test]
    fn threshold_clears_when_metric_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(&dir);
        for _ in 0..5 {
            s.record_issue_completed();
        }
        s.record_quality_fix_rounds(10);
        let proposals = s.check_thresholds(0.5, 0.6, 0.3);
        assert_eq!(proposals.len(), 1);
        assert_eq!(s.fired_thresholds(), &["quality_fix_rate".to_string()]);

        // Grow issues_completed without more fix rounds: rate drops back down.
        for _ in 0..20 {
            s.record_issue_completed();
        }
        let proposals = s.check_thresholds(0.5, 0.6, 0.3);
        assert!(proposals.is_empty());
        assert!(s.fired_thresholds().is_empty());
    }
}
