//! One module per class of agent invocation (triage, plan, implement,
//! review, CI fix, HITL correction), a shared `PhaseRunner` trait and
//! driver, and the CI wait/fix retry loop that sits downstream of review.

pub mod ci_loop;
pub mod conflict;
pub mod context;
pub mod hitl;
pub mod implementer;
pub mod planner;
pub mod reviewer;
pub mod runner;
pub mod sentinels;
pub mod triage;

pub use ci_loop::{wait_and_fix_ci, wait_for_ci, CiOutcome, CiWaitConfig};
pub use conflict::ConflictResolverRunner;
pub use context::PhaseContext;
pub use hitl::HitlRunner;
pub use implementer::ImplementerRunner;
pub use planner::{PlanOutput, PlannerRunner};
pub use reviewer::ReviewerRunner;
pub use runner::{run_phase, PhaseError, PhaseRunner};
pub use sentinels::{extract_memory_suggestion, extract_summary, parse_verdict, tail_chars};
pub use triage::{TriageOutcome, TriageRunner};
