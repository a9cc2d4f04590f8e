//! Shared error kinds that cross phase-loop boundaries and must be matched
//! on explicitly rather than treated as opaque failures.

use thiserror::Error;

/// Errors an agent subprocess invocation can surface that the orchestrator
/// must react to specially, as opposed to a routine per-work-item failure.
#[derive(Debug, Error)]
pub enum AgentProcessError {
    #[error("agent process reported an authentication failure: {0}")]
    Authentication(String),

    #[error("agent process reported credit exhaustion: {0}")]
    CreditExhausted(String),

    #[error("agent process timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("agent process exited with code {code:?}: {detail}")]
    NonZeroExit { code: Option<i32>, detail: String },

    #[error("agent process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentProcessError {
    /// Fatal errors stop the entire orchestrator rather than just the
    /// current work item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentProcessError::Authentication(_) | AgentProcessError::CreditExhausted(_)
        )
    }
}
