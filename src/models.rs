//! Core data models for decisions, runs and audit records

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::state::WorkflowState;

//
// ================= Decision =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
    Bypassed,
}

impl DecisionStatus {
    pub fn is_terminal(self) -> bool {
        self != DecisionStatus::Pending
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionStatus::Pending => "PENDING",
            DecisionStatus::Approved => "APPROVED",
            DecisionStatus::Rejected => "REJECTED",
            DecisionStatus::Timeout => "TIMEOUT",
            DecisionStatus::Bypassed => "BYPASSED",
        };
        write!(f, "{}", s)
    }
}

/// One HITL gate instance and its eventual resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: Uuid,
    pub run_id: Uuid,
    pub agent_id: String,
    pub session_id: String,
    pub user_id: String,
    pub decision_type: String,
    pub description: String,
    /// Snapshot of the values shown to the reviewer
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub timeout_seconds: u64,
    pub status: DecisionStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_reason: Option<String>,
    pub comment: Option<String>,
}

impl Decision {
    /// Saturates at the end of representable time instead of overflowing.
    pub fn deadline(&self) -> DateTime<Utc> {
        i64::try_from(self.timeout_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|timeout| self.created_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == DecisionStatus::Pending && self.deadline() <= now
    }

    /// Apply a terminal transition. Only PENDING decisions move; anything
    /// else reports a conflict carrying the current terminal state.
    pub fn resolve(
        &mut self,
        to: DecisionStatus,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        if self.status.is_terminal() {
            return Err(WorkflowError::DecisionConflict(Box::new(self.clone())));
        }
        let reason = match to {
            DecisionStatus::Approved => "Approved by user".to_string(),
            DecisionStatus::Rejected => "Rejected by user".to_string(),
            DecisionStatus::Timeout => {
                format!("Timed out after {} seconds", self.timeout_seconds)
            }
            DecisionStatus::Bypassed => "Autonomous mode enabled".to_string(),
            DecisionStatus::Pending => {
                return Err(WorkflowError::Validation(format!(
                    "decision {} cannot transition to {}",
                    self.id, to
                )));
            }
        };

        self.resolution_reason = Some(reason);
        self.status = to;
        self.resolved_at = Some(at);
        self.comment = comment;
        Ok(())
    }
}

//
// ================= Audit =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Aborted,
}

/// Immutable summary of one terminal run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub workflow_id: String,
    pub session_id: String,
    pub run_id: Uuid,

    pub inputs: Value,
    pub input_hash: String,
    pub reasoning_trace: Vec<String>,
    pub final_state: Value,

    pub hitl_required: bool,
    pub decision_id: Option<Uuid>,
    pub decision_outcome: Option<DecisionStatus>,

    pub outcome: RunOutcome,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

//
// ================= Run Result =================
//

/// What a call to `run` / `resume` produced.
#[derive(Debug)]
pub enum RunResult {
    Completed {
        run_id: Uuid,
        state: WorkflowState,
    },
    Suspended {
        run_id: Uuid,
        decision: Decision,
        /// Reasoning trace of the parked state at the gate
        trace: Vec<String>,
    },
    Aborted {
        run_id: Uuid,
        error: WorkflowError,
        state: WorkflowState,
    },
}

impl RunResult {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunResult::Completed { run_id, .. }
            | RunResult::Suspended { run_id, .. }
            | RunResult::Aborted { run_id, .. } => *run_id,
        }
    }

    pub fn decision_id(&self) -> Option<Uuid> {
        match self {
            RunResult::Suspended { decision, .. } => Some(decision.id),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunResult::Completed { .. })
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, RunResult::Suspended { .. })
    }
}

/// Serializable view of a `RunResult` for callers outside the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: String,
    pub reasoning_trace: Vec<String>,
    pub result: Value,
    pub decision: Option<Decision>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

impl From<&RunResult> for RunSummary {
    fn from(result: &RunResult) -> Self {
        match result {
            RunResult::Completed { run_id, state } => RunSummary {
                run_id: *run_id,
                status: "completed".to_string(),
                reasoning_trace: state.trace().to_vec(),
                result: state.snapshot(),
                decision: None,
                error_kind: None,
                error: None,
            },
            RunResult::Suspended { run_id, decision, trace } => RunSummary {
                run_id: *run_id,
                status: "awaiting_approval".to_string(),
                reasoning_trace: trace.clone(),
                result: serde_json::json!({ "description": decision.description }),
                decision: Some(decision.clone()),
                error_kind: None,
                error: None,
            },
            RunResult::Aborted { run_id, error, state } => RunSummary {
                run_id: *run_id,
                status: "aborted".to_string(),
                reasoning_trace: state.trace().to_vec(),
                result: Value::Null,
                decision: None,
                error_kind: Some(error.kind().to_string()),
                error: Some(error.to_string()),
            },
        }
    }
}
