//! Financial Agent Workflows
//!
//! Declarative agent workflows over a small graph engine:
//! - Workflows are JSON documents whose steps and conditions resolve
//!   against registries at load time
//! - Steps run sequentially with per-attempt timeouts and retries
//! - Risky results suspend on a human decision that can be approved,
//!   rejected, left to time out or bypassed
//! - Every finished run is written to a per-agent audit trail
//!
//! FLOW:
//! ENTRY → STEP → EDGE → ... → GATE → (SUSPEND → DECISION → REVIEW) → END

pub mod agents;
pub mod api;
pub mod audit;
pub mod config;
pub mod definition;
pub mod error;
pub mod execution;
pub mod hitl;
pub mod models;
pub mod state;
pub mod steps;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use execution::{Resolution, RunOptions, WorkflowEngine};
