pub mod git_runner;
pub mod manager;

pub use git_runner::{GitOutput, GitRunner, RealGitRunner};
pub use manager::{GitIdentity, WorktreeError, WorktreeManager};
