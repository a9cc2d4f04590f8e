//! Thin wrapper over `octocrab` covering the issue/PR/label/comment/check-run
//! operations the orchestrator needs from GitHub. Constructed once from a
//! token + owner/repo; `octocrab::Error` is translated into a crate-local
//! error at this one seam.

use std::collections::BTreeSet;

use octocrab::Octocrab;
use thiserror::Error;

use hydra_core::Issue;

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub API error: {0}")]
    Api(#[from] octocrab::Error),
    #[error("missing GitHub token — set GH_TOKEN")]
    MissingToken,
    #[error("PR #{0} has no head SHA")]
    MissingHeadSha(u64),
}

pub type Result<T> = std::result::Result<T, GitHubError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckConclusion {
    Success,
    Failure,
    Pending,
}

#[derive(Debug, Clone)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
    pub conclusion: CheckConclusion,
}

#[derive(Debug, Clone)]
pub struct PullRequestSummary {
    pub number: u64,
    pub branch: String,
    pub base: String,
    pub draft: bool,
    pub head_sha: Option<String>,
    pub url: String,
}

/// Constructed once from `GH_TOKEN`/owner/repo; the single point where
/// `octocrab::Error` is translated into [`GitHubError`].
#[derive(Clone)]
pub struct GitHubClient {
    octocrab: Octocrab,
    owner: String,
    repo: String,
}

impl GitHubClient {
    pub fn new(token: impl Into<String>, owner: impl Into<String>, repo: impl Into<String>) -> Result<Self> {
        let octocrab = Octocrab::builder().personal_token(token.into()).build()?;
        Ok(Self {
            octocrab,
            owner: owner.into(),
            repo: repo.into(),
        })
    }

    pub fn from_env(repo_spec: &str) -> Result<Self> {
        let token = std::env::var("GH_TOKEN")
            .or_else(|_| std::env::var("GITHUB_TOKEN"))
            .map_err(|_| GitHubError::MissingToken)?;
        let (owner, repo) = repo_spec
            .split_once('/')
            .unwrap_or(("", repo_spec));
        Self::new(token, owner, repo)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// List open issues carrying any of `labels`, most-recently-updated first.
    pub async fn list_issues_with_labels(&self, labels: &[String]) -> Result<Vec<Issue>> {
        let mut out = Vec::new();
        let mut page = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .list()
            .state(octocrab::params::State::Open)
            .labels(labels)
            .per_page(100)
            .send()
            .await?;

        loop {
            for issue in &page.items {
                if issue.pull_request.is_some() {
                    continue; // PRs surface in the issues API too; skip them
                }
                out.push(to_issue(issue));
            }
            match self.octocrab.get_page(&page.next).await? {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(out)
    }

    pub async fn get_issue(&self, number: u64) -> Result<Issue> {
        let issue = self.octocrab.issues(&self.owner, &self.repo).get(number).await?;
        Ok(to_issue(&issue))
    }

    pub async fn add_labels(&self, number: u64, labels: &[String]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        self.octocrab
            .issues(&self.owner, &self.repo)
            .add_labels(number, labels)
            .await?;
        Ok(())
    }

    pub async fn remove_label(&self, number: u64, label: &str) -> Result<()> {
        // Missing-label removal is a routine no-op in the original CLI
        // wrapper; swallow 404s the same way.
        match self
            .octocrab
            .issues(&self.owner, &self.repo)
            .remove_label(number, label)
            .await
        {
            Ok(_) => Ok(()),
            Err(octocrab::Error::GitHub { source, .. }) if source.status_code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn swap_labels(&self, number: u64, remove: &[String], add: &[String]) -> Result<()> {
        for label in remove {
            self.remove_label(number, label).await?;
        }
        self.add_labels(number, add).await
    }

    pub async fn post_comment(&self, number: u64, body: &str) -> Result<()> {
        self.octocrab
            .issues(&self.owner, &self.repo)
            .create_comment(number, body)
            .await?;
        Ok(())
    }

    /// An issue's comments, oldest first — the HITL loop inspects the last
    /// one to tell a fresh human reply apart from its own escalation
    /// comment.
    pub async fn list_comments(&self, number: u64) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut page = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .list_comments(number)
            .per_page(100)
            .send()
            .await?;

        loop {
            out.extend(page.items.iter().map(|c| c.body.clone().unwrap_or_default()));
            match self.octocrab.get_page(&page.next).await? {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(out)
    }

    pub async fn update_issue_body(&self, number: u64, body: &str) -> Result<()> {
        self.octocrab
            .issues(&self.owner, &self.repo)
            .update(number)
            .body(body)
            .send()
            .await?;
        Ok(())
    }

    pub async fn close_issue(&self, number: u64) -> Result<()> {
        self.octocrab
            .issues(&self.owner, &self.repo)
            .update(number)
            .state(octocrab::models::IssueState::Closed)
            .send()
            .await?;
        Ok(())
    }

    pub async fn create_pr(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
        draft: bool,
    ) -> Result<PullRequestSummary> {
        let pr = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .create(title, head, base)
            .body(body)
            .draft(draft)
            .send()
            .await?;
        Ok(to_pr_summary(&pr))
    }

    pub async fn get_pr(&self, number: u64) -> Result<PullRequestSummary> {
        let pr = self.octocrab.pulls(&self.owner, &self.repo).get(number).await?;
        Ok(to_pr_summary(&pr))
    }

    pub async fn diff(&self, number: u64) -> Result<String> {
        Ok(self.octocrab.pulls(&self.owner, &self.repo).get_diff(number).await?)
    }

    pub async fn merge_pr(&self, number: u64, commit_title: Option<&str>) -> Result<()> {
        let route = format!("/repos/{}/{}/pulls/{}/merge", self.owner, self.repo, number);
        let mut body = serde_json::json!({ "merge_method": "merge" });
        if let Some(title) = commit_title {
            body["commit_title"] = serde_json::json!(title);
        }
        self.octocrab
            .put::<serde_json::Value, _, _>(route, Some(&body))
            .await?;
        Ok(())
    }

    /// Check-run conclusions for a PR's head commit, used by the CI
    /// wait/fix loop's polling step.
    pub async fn list_check_runs(&self, pr_number: u64) -> Result<Vec<CheckRun>> {
        let pr = self.get_pr(pr_number).await?;
        let sha = pr.head_sha.ok_or(GitHubError::MissingHeadSha(pr_number))?;

        let route = format!(
            "/repos/{}/{}/commits/{}/check-runs",
            self.owner, self.repo, sha
        );
        let response: serde_json::Value = self.octocrab.get(route, None::<&()>).await?;

        let runs = response
            .get("check_runs")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(runs
            .into_iter()
            .map(|run| {
                let status = run.get("status").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let conclusion_str = run.get("conclusion").and_then(|v| v.as_str());
                let conclusion = match (status.as_str(), conclusion_str) {
                    (_, Some("success")) | (_, Some("neutral")) | (_, Some("skipped")) => {
                        CheckConclusion::Success
                    }
                    (_, Some(_)) => CheckConclusion::Failure,
                    ("completed", None) => CheckConclusion::Failure,
                    _ => CheckConclusion::Pending,
                };
                CheckRun {
                    name: run.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    status,
                    conclusion,
                }
            })
            .collect())
    }
}

fn to_issue(issue: &octocrab::models::issues::Issue) -> Issue {
    Issue {
        number: issue.number,
        title: issue.title.clone(),
        body: issue.body.clone().unwrap_or_default(),
        labels: issue
            .labels
            .iter()
            .map(|l| l.name.clone())
            .collect::<BTreeSet<_>>(),
        comments: Vec::new(),
        url: issue.html_url.to_string(),
    }
}

fn to_pr_summary(pr: &octocrab::models::pulls::PullRequest) -> PullRequestSummary {
    PullRequestSummary {
        number: pr.number,
        branch: pr.head.ref_field.clone(),
        base: pr.base.ref_field.clone(),
        draft: pr.draft.unwrap_or(false),
        head_sha: Some(pr.head.sha.clone()),
        url: pr
            .html_url
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_default(),
    }
}
