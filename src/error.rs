//! Error types for the workflow engine

use crate::models::Decision;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Error, Debug)]
pub enum WorkflowError {

    // =============================
    // Definition / Run Errors
    // =============================

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Step '{step}' failed after {attempts} attempt(s): {message}")]
    StepExecution {
        step: String,
        message: String,
        retryable: bool,
        attempts: u32,
    },

    #[error("Condition '{condition}' on step '{step}' returned unmapped branch '{branch}'")]
    UnmappedBranch {
        step: String,
        condition: String,
        branch: String,
    },

    #[error("Iteration limit of {0} exceeded")]
    IterationLimitExceeded(u32),

    // =============================
    // Decision / HITL Errors
    // =============================

    #[error("Decision {} is already resolved as {}", .0.id, .0.status)]
    DecisionConflict(Box<Decision>),

    #[error("Decision not found: {0}")]
    DecisionNotFound(Uuid),

    #[error("No suspended run for decision {0}")]
    RunNotFound(Uuid),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    // =============================
    // Ambient Errors
    // =============================

    #[error("Audit write error: {0}")]
    AuditWrite(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WorkflowError {
    /// Stable tag used in audit records and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::Validation(_) => "validation",
            WorkflowError::StepExecution { .. } => "step_execution",
            WorkflowError::UnmappedBranch { .. } => "unmapped_branch",
            WorkflowError::IterationLimitExceeded(_) => "iteration_limit_exceeded",
            WorkflowError::DecisionConflict(_) => "decision_conflict",
            WorkflowError::DecisionNotFound(_) => "decision_not_found",
            WorkflowError::RunNotFound(_) => "run_not_found",
            WorkflowError::WorkflowNotFound(_) => "workflow_not_found",
            WorkflowError::AuditWrite(_) => "audit_write",
            WorkflowError::Config(_) => "config",
            WorkflowError::SerializationError(_) => "serialization",
            WorkflowError::IoError(_) => "io",
        }
    }
}
