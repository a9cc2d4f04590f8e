//! The event model published on [`hydra_bus`](../hydra_bus/index.html).
//!
//! Each event carries only the fields its kind actually has, rather than a
//! `HashMap<String, Value>` bag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ReviewVerdict, WorkerStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerUpdateEvent {
    pub issue_number: u64,
    pub worker_id: usize,
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewUpdateEvent {
    pub pr_number: u64,
    pub issue_number: u64,
    pub worker_id: usize,
    pub status: String,
    pub verdict: Option<ReviewVerdict>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageUpdateEvent {
    pub issue_number: u64,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlUpdateEvent {
    pub issue_number: u64,
    pub cause: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiCheckEvent {
    pub pr_number: u64,
    pub attempt: u32,
    pub status: String,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLineEvent {
    pub issue_number: Option<u64>,
    pub source: String,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseChangeEvent {
    pub phase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStartEvent {
    pub batch: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCompleteEvent {
    pub batch: u64,
    pub implemented: u32,
    pub prs_created: u32,
    pub approved: u32,
    pub merged: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatusEvent {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub scope: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemAlertEvent {
    pub message: String,
    pub fatal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationJudgeEvent {
    pub issue_number: u64,
    pub passed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HydraEvent {
    WorkerUpdate(WorkerUpdateEvent),
    ReviewUpdate(ReviewUpdateEvent),
    TriageUpdate(TriageUpdateEvent),
    HitlUpdate(HitlUpdateEvent),
    CiCheck(CiCheckEvent),
    TranscriptLine(TranscriptLineEvent),
    PhaseChange(PhaseChangeEvent),
    BatchStart(BatchStartEvent),
    BatchComplete(BatchCompleteEvent),
    OrchestratorStatus(OrchestratorStatusEvent),
    Error(ErrorEvent),
    SystemAlert(SystemAlertEvent),
    VerificationJudge(VerificationJudgeEvent),
}

impl HydraEvent {
    /// Stable discriminant string, handy for logging and filtering without
    /// an exhaustive match at every call site.
    pub fn kind(&self) -> &'static str {
        match self {
            HydraEvent::WorkerUpdate(_) => "worker_update",
            HydraEvent::ReviewUpdate(_) => "review_update",
            HydraEvent::TriageUpdate(_) => "triage_update",
            HydraEvent::HitlUpdate(_) => "hitl_update",
            HydraEvent::CiCheck(_) => "ci_check",
            HydraEvent::TranscriptLine(_) => "transcript_line",
            HydraEvent::PhaseChange(_) => "phase_change",
            HydraEvent::BatchStart(_) => "batch_start",
            HydraEvent::BatchComplete(_) => "batch_complete",
            HydraEvent::OrchestratorStatus(_) => "orchestrator_status",
            HydraEvent::Error(_) => "error",
            HydraEvent::SystemAlert(_) => "system_alert",
            HydraEvent::VerificationJudge(_) => "verification_judge",
        }
    }
}

/// Envelope actually carried on the bus: the typed event plus a timestamp,
/// matching spec's `{type, data, timestamp}` shape without the untyped bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: HydraEvent,
}

impl Envelope {
    pub fn new(event: HydraEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}
