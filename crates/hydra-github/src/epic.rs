//! Epic auto-close: when every sub-issue of an epic carries the "fixed"
//! label, tick its checkbox list and close it.

use regex::Regex;
use std::sync::LazyLock;

use crate::client::{GitHubClient, GitHubError};

static CHECKBOX_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"- \[[ x]\] #(\d+)").expect("valid regex"));

static UNCHECKED_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"- \[ \] (#\d+)").expect("valid regex"));

/// Extracts every `- [ ] #123` / `- [x] #123` sub-issue reference from an
/// epic's body, in document order, duplicates included.
pub fn parse_epic_sub_issues(body: &str) -> Vec<u64> {
    CHECKBOX_PATTERN
        .captures_iter(body)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect()
}

/// Ticks every unchecked sub-issue checkbox in an epic body.
pub fn check_all_checkboxes(body: &str) -> String {
    UNCHECKED_PATTERN.replace_all(body, "- [x] $1").into_owned()
}

pub struct EpicCompletionChecker<'a> {
    client: &'a GitHubClient,
    epic_label: String,
    fixed_label: String,
}

impl<'a> EpicCompletionChecker<'a> {
    pub fn new(client: &'a GitHubClient, epic_label: impl Into<String>, fixed_label: impl Into<String>) -> Self {
        Self {
            client,
            epic_label: epic_label.into(),
            fixed_label: fixed_label.into(),
        }
    }

    /// Called after an issue is marked `fixed_label`. Finds every open epic
    /// referencing `completed_issue_number` and closes it if every one of
    /// its sub-issues is now fixed.
    pub async fn check_and_close_epics(&self, completed_issue_number: u64) -> Result<Vec<u64>, GitHubError> {
        let epics = self
            .client
            .list_issues_with_labels(&[self.epic_label.clone()])
            .await?;

        let mut closed = Vec::new();
        for epic in epics {
            let sub_issues = parse_epic_sub_issues(&epic.body);
            if !sub_issues.contains(&completed_issue_number) {
                continue;
            }
            if self.try_close_epic(epic.number, &epic.body, &sub_issues).await? {
                closed.push(epic.number);
            }
        }
        Ok(closed)
    }

    async fn try_close_epic(&self, epic_number: u64, body: &str, sub_issues: &[u64]) -> Result<bool, GitHubError> {
        for &sub in sub_issues {
            let issue = self.client.get_issue(sub).await?;
            if !issue.labels.contains(&self.fixed_label) {
                return Ok(false);
            }
        }

        let updated_body = check_all_checkboxes(body);
        self.client.update_issue_body(epic_number, &updated_body).await?;
        self.client
            .add_labels(epic_number, &[self.fixed_label.clone()])
            .await?;
        self.client
            .post_comment(
                epic_number,
                "All sub-issues are fixed. Closing this epic automatically.",
            )
            .await?;
        self.client.close_issue(epic_number).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sub_issue_numbers_in_order() {
        let body = "- [ ] #10\n- [x] #20\nsome text\n- [ ] #30";
        assert_eq!(parse_epic_sub_issues(body), vec![10, 20, 30]);
    }

    #[test]
    fn ignores_non_checkbox_issue_mentions() {
        let body = "see #99 for context\n- [ ] #10";
        assert_eq!(parse_epic_sub_issues(body), vec![10]);
    }

    #[test]
    fn checks_all_unchecked_boxes() {
        let body = "- [ ] #10\n- [x] #20\n- [ ] #30";
        let updated = check_all_checkboxes(body);
        assert_eq!(updated, "- [x] #10\n- [x] #20\n- [x] #30");
    }

    #[test]
    fn checking_boxes_is_idempotent() {
        let body = "- [x] #10\n- [x] #20";
        assert_eq!(check_all_checkboxes(body), body);
    }
}
