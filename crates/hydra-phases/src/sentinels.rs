//! Terminal-line sentinel parsing shared across review-shaped runners:
//! `VERDICT:`/`SUMMARY:` lines and `MEMORY_SUGGESTION_START`/`_END` blocks.

use std::sync::LazyLock;

use regex::Regex;

use hydra_core::ReviewVerdict;

static VERDICT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)VERDICT:\s*(APPROVE|REQUEST_CHANGES|COMMENT)").expect("valid regex")
});

static SUMMARY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SUMMARY:\s*(.+)").expect("valid regex"));

static MEMORY_SUGGESTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)MEMORY_SUGGESTION_START\s*(.*?)\s*MEMORY_SUGGESTION_END").expect("valid regex")
});

/// Parses a `VERDICT: (APPROVE|REQUEST_CHANGES|COMMENT)` line; missing or
/// unrecognized verdict defaults to COMMENT.
pub fn parse_verdict(transcript: &str) -> ReviewVerdict {
    match VERDICT_PATTERN
        .captures(transcript)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_uppercase())
    {
        Some(s) if s == "APPROVE" => ReviewVerdict::Approve,
        Some(s) if s == "REQUEST_CHANGES" => ReviewVerdict::RequestChanges,
        _ => ReviewVerdict::Comment,
    }
}

/// Parses a `SUMMARY: <text>` line; falls back to the last non-empty
/// transcript line truncated to 200 characters.
pub fn extract_summary(transcript: &str) -> String {
    if let Some(captures) = SUMMARY_PATTERN.captures(transcript) {
        if let Some(m) = captures.get(1) {
            return m.as_str().trim().to_string();
        }
    }
    let fallback = transcript
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim();
    truncate_chars(fallback, 200)
}

/// Extracts the body of a `MEMORY_SUGGESTION_START ... MEMORY_SUGGESTION_END`
/// block, if present.
pub fn extract_memory_suggestion(transcript: &str) -> Option<String> {
    MEMORY_SUGGESTION_PATTERN
        .captures(transcript)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Last `n` characters of `s`, by char boundary, used to embed failing
/// quality-gate/CI output into a focused fix prompt.
pub fn tail_chars(s: &str, n: usize) -> &str {
    let char_count = s.chars().count();
    if char_count <= n {
        return s;
    }
    let skip = char_count - n;
    let byte_offset = s
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &s[byte_offset..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_verdict_case_insensitively() {
        assert_eq!(parse_verdict("verdict: approve"), ReviewVerdict::Approve);
        assert_eq!(
            parse_verdict("VERDICT: REQUEST_CHANGES"),
            ReviewVerdict::RequestChanges
        );
        assert_eq!(parse_verdict("VERDICT: COMMENT"), ReviewVerdict::Comment);
    }

    #[test]
    fn missing_verdict_defaults_to_comment() {
        assert_eq!(parse_verdict("no verdict here"), ReviewVerdict::Comment);
    }

    #[test]
    fn summary_falls_back_to_last_nonempty_line_truncated() {
        let transcript = "line one\n\nthis is the last line";
        assert_eq!(extract_summary(transcript), "this is the last line");
    }

    #[test]
    fn summary_prefers_explicit_sentinel() {
        let transcript = "blah\nSUMMARY: the real summary\nmore text";
        assert_eq!(extract_summary(transcript), "the real summary");
    }

    #[test]
    fn memory_suggestion_block_is_extracted() {
        let transcript = "pre\nMEMORY_SUGGESTION_START\nAlways run tests first.\nMEMORY_SUGGESTION_END\npost";
        assert_eq!(
            extract_memory_suggestion(transcript).as_deref(),
            Some("Always run tests first.")
        );
    }

    #[test]
    fn tail_chars_keeps_last_n() {
        let s = "0123456789";
        assert_eq!(tail_chars(s, 4), "6789");
        assert_eq!(tail_chars(s, 100), s);
    }
}
