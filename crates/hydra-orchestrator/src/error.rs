use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("github error: {0}")]
    GitHub(#[from] hydra_github::GitHubError),
    #[error("config error: {0}")]
    Config(#[from] hydra_core::ConfigError),
}
