//! Transcript assembly over a [`Process`]'s stdout: writes the prompt,
//! drains newline-delimited JSON lines, republishes each as a
//! `TRANSCRIPT_LINE` event, and returns the assembled transcript.

use std::collections::HashSet;
use std::sync::Arc;

use hydra_bus::EventBus;
use hydra_core::events::TranscriptLineEvent;
use hydra_core::{Envelope, HydraEvent};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::executor::Process;

#[derive(Debug, Error)]
pub enum StreamReaderError {
    #[error("agent reported an authentication failure: {0}")]
    Authentication(String),
    #[error("agent reported credit exhaustion: {0}")]
    CreditExhausted(String),
    #[error("process I/O error: {0}")]
    Io(#[from] crate::executor::ExecutorError),
}

/// Case-insensitive substrings that mark an authentication failure, and the
/// stderr sentinel for credit exhaustion. Configurable per deployment
/// rather than hardcoded, per SPEC_FULL §4.2.
#[derive(Debug, Clone)]
pub struct StreamReaderConfig {
    pub auth_sentinels: Vec<String>,
    pub credit_sentinels: Vec<String>,
    pub source_tag: String,
}

impl Default for StreamReaderConfig {
    fn default() -> Self {
        Self {
            auth_sentinels: vec![
                "invalid api key".into(),
                "authentication_error".into(),
                "please run /login".into(),
            ],
            credit_sentinels: vec!["credit balance is too low".into()],
            source_tag: "agent".into(),
        }
    }
}

/// The set of in-flight processes a runner owns, so `terminate()` can
/// `killpg` everything still running at shutdown. Shared across concurrent
/// `drive()` calls within one runner.
pub type LiveProcessSet = Arc<Mutex<HashSet<Uuid>>>;

/// Writes `prompt` to `process`'s stdin, closes it, drains stdout line by
/// line, republishes each line, and returns the assembled transcript.
///
/// Registers `process`'s id in `live` on entry and removes it on exit
/// (including early-return-on-error paths) so a caller holding `live` can
/// `killpg` whatever's still running when it decides to shut down.
pub async fn drive(
    process: &mut dyn Process,
    prompt: &str,
    issue_number: Option<u64>,
    bus: Option<&EventBus>,
    live: &LiveProcessSet,
    config: &StreamReaderConfig,
) -> Result<String, StreamReaderError> {
    let id = process.id();
    live.lock().await.insert(id);
    let result = drive_inner(process, prompt, issue_number, bus, config).await;
    live.lock().await.remove(&id);
    result
}

async fn drive_inner(
    process: &mut dyn Process,
    prompt: &str,
    issue_number: Option<u64>,
    bus: Option<&EventBus>,
    config: &StreamReaderConfig,
) -> Result<String, StreamReaderError> {
    process.write_stdin(prompt.as_bytes()).await?;
    process.close_stdin().await?;

    let mut transcript = String::new();
    while let Some(line) = process.next_stdout_line().await {
        if let Some(bus) = bus {
            bus.publish(Envelope::new(HydraEvent::TranscriptLine(TranscriptLineEvent {
                issue_number,
                source: config.source_tag.clone(),
                line: line.clone(),
            })));
        }

        let rendered = render_line(&line);
        let lowered = rendered.to_lowercase();
        if let Some(hit) = config
            .auth_sentinels
            .iter()
            .find(|s| lowered.contains(s.as_str()))
        {
            return Err(StreamReaderError::Authentication(hit.clone()));
        }

        if !transcript.is_empty() {
            transcript.push('\n');
        }
        transcript.push_str(&rendered);
    }

    let exit_code = process.wait().await?;
    let stderr = process.stderr_snapshot();
    let stderr_lower = stderr.to_lowercase();
    if let Some(hit) = config
        .credit_sentinels
        .iter()
        .find(|s| stderr_lower.contains(s.as_str()))
    {
        return Err(StreamReaderError::CreditExhausted(hit.clone()));
    }
    let _ = exit_code;

    Ok(transcript)
}

/// Best-effort text extraction from a `stream-json` event line: walk the
/// known `{"message": {"content": [{"type": "text", "text": "..."}]}}`
/// shape, fall back to a top-level `text`/`content` string field, and fall
/// back to the raw line verbatim on any mismatch.
fn render_line(line: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return line.to_string();
    };

    if let Some(text) = extract_message_text(&value) {
        return text;
    }
    if let Some(text) = value.get("text").and_then(|v| v.as_str()) {
        return text.to_string();
    }
    if let Some(text) = value.get("content").and_then(|v| v.as_str()) {
        return text.to_string();
    }
    line.to_string()
}

fn extract_message_text(value: &serde_json::Value) -> Option<String> {
    let content = value.get("message")?.get("content")?.as_array()?;
    let mut out = String::new();
    for block in content {
        if block.get("type").and_then(|t| t.as_str()) == Some("text") {
            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct FakeProcess {
        id: Uuid,
        lines: VecDeque<String>,
        stderr: String,
        written: Vec<u8>,
    }

    #[async_trait]
    impl Process for FakeProcess {
        fn id(&self) -> Uuid {
            self.id
        }
        async fn write_stdin(&mut self, data: &[u8]) -> Result<(), crate::executor::ExecutorError> {
            self.written.extend_from_slice(data);
            Ok(())
        }
        async fn close_stdin(&mut self) -> Result<(), crate::executor::ExecutorError> {
            Ok(())
        }
        async fn next_stdout_line(&mut self) -> Option<String> {
            self.lines.pop_front()
        }
        fn stderr_snapshot(&self) -> String {
            self.stderr.clone()
        }
        async fn kill(&mut self) -> Result<(), crate::executor::ExecutorError> {
            Ok(())
        }
        async fn wait(&mut self) -> Result<Option<i32>, crate::executor::ExecutorError> {
            Ok(Some(0))
        }
    }

    #[tokio::test]
    async fn transcript_concatenates_rendered_lines_in_order() {
        let mut process = FakeProcess {
            id: Uuid::new_v4(),
            lines: VecDeque::from([
                r#"{"text": "hello"}"#.to_string(),
                r#"{"text": "world"}"#.to_string(),
            ]),
            stderr: String::new(),
            written: Vec::new(),
        };
        let live = LiveProcessSet::default();
        let transcript = drive(&mut process, "prompt", None, None, &live, &StreamReaderConfig::default())
            .await
            .unwrap();
        assert_eq!(transcript, "hello\nworld");
        assert_eq!(process.written, b"prompt");
    }

    #[tokio::test]
    async fn malformed_line_falls_back_to_raw_text() {
        let mut process = FakeProcess {
            id: Uuid::new_v4(),
            lines: VecDeque::from(["not json at all".to_string()]),
            stderr: String::new(),
            written: Vec::new(),
        };
        let live = LiveProcessSet::default();
        let transcript = drive(&mut process, "p", None, None, &live, &StreamReaderConfig::default())
            .await
            .unwrap();
        assert_eq!(transcript, "not json at all");
    }

    #[tokio::test]
    async fn authentication_sentinel_raises_tagged_error() {
        let mut process = FakeProcess {
            id: Uuid::new_v4(),
            lines: VecDeque::from([r#"{"text": "Invalid API key detected"}"#.to_string()]),
            stderr: String::new(),
            written: Vec::new(),
        };
        let live = LiveProcessSet::default();
        let err = drive(&mut process, "p", None, None, &live, &StreamReaderConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamReaderError::Authentication(_)));
    }

    #[tokio::test]
    async fn credit_exhaustion_detected_from_stderr_after_eof() {
        let mut process = FakeProcess {
            id: Uuid::new_v4(),
            lines: VecDeque::new(),
            stderr: "Error: credit balance is too low".to_string(),
            written: Vec::new(),
        };
        let live = LiveProcessSet::default();
        let err = drive(&mut process, "p", None, None, &live, &StreamReaderConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamReaderError::CreditExhausted(_)));
    }

    #[tokio::test]
    async fn live_set_is_cleared_on_exit() {
        let mut process = FakeProcess {
            id: Uuid::new_v4(),
            lines: VecDeque::new(),
            stderr: String::new(),
            written: Vec::new(),
        };
        let id = process.id();
        let live = LiveProcessSet::default();
        drive(&mut process, "p", None, None, &live, &StreamReaderConfig::default())
            .await
            .unwrap();
        assert!(!live.lock().await.contains(&id));
    }

    #[test]
    fn render_line_extracts_assistant_text_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        assert_eq!(render_line(line), "hi");
    }
}
