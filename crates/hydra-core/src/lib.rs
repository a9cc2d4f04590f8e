pub mod best_effort;
pub mod config;
pub mod error;
pub mod events;
pub mod shutdown;
pub mod types;

pub use best_effort::{best_effort, best_effort_async};
pub use config::{ConfigError, FileConfig, HydraConfig};
pub use error::AgentProcessError;
pub use events::{Envelope, HydraEvent};
pub use shutdown::{DrainResult, ShutdownGuard, ShutdownSignal};
pub use types::*;
