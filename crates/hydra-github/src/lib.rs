pub mod client;
pub mod epic;
pub mod fetcher;

pub use client::{CheckConclusion, CheckRun, GitHubClient, GitHubError, PullRequestSummary};
pub use epic::{check_all_checkboxes, parse_epic_sub_issues, EpicCompletionChecker};
pub use fetcher::{GitHubIssueFetcher, StageLabels};
