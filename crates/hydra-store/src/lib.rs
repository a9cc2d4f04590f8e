pub mod issue_store;
pub mod session_log;
pub mod state_store;

pub use issue_store::{IssueFetcher, IssueStore};
pub use session_log::{SessionLogError, SessionLogStore};
pub use state_store::{LifetimeStats, StateData, StateStore, StateStoreError, ThresholdProposal};
