//! The four financial agents
//!
//! Each agent is a workflow document plus the step functions and gating
//! condition it references. All four share the review step and the
//! resolution condition; they differ only in their analytics and the
//! thresholds that call for a human.

pub mod compliance;
pub mod index_scraper;
pub mod portfolio;
pub mod timing_advisor;

use crate::config::Settings;
use crate::definition::WorkflowDefinition;
use crate::execution::WorkflowEngine;
use crate::hitl::{check_approval, CHECK_APPROVAL};
use crate::models::DecisionStatus;
use crate::state::WorkflowState;
use crate::steps::{ConditionRegistry, StepError, StepRegistry, StepResult};
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const PORTFOLIO_OPTIMIZER: &str = "portfolio_optimizer";
pub const INDEX_SCRAPER: &str = "index_scraper";
pub const TIMING_ADVISOR: &str = "timing_advisor";
pub const COMPLIANCE_LOGGER: &str = "compliance_logger";

/// Registry id of the shared human review step.
pub const REVIEW_STEP: &str = "hitl.review";

const WORKFLOWS: [(&str, &str); 4] = [
    (
        PORTFOLIO_OPTIMIZER,
        include_str!("../../workflows/portfolio_optimizer.json"),
    ),
    (INDEX_SCRAPER, include_str!("../../workflows/index_scraper.json")),
    (TIMING_ADVISOR, include_str!("../../workflows/timing_advisor.json")),
    (
        COMPLIANCE_LOGGER,
        include_str!("../../workflows/compliance_logger.json"),
    ),
];

/// Every built-in step and condition.
pub fn default_registries() -> (StepRegistry, ConditionRegistry) {
    let mut steps = StepRegistry::new();
    let mut conditions = ConditionRegistry::new();

    steps.register_fn(REVIEW_STEP, review);
    conditions.register(CHECK_APPROVAL, Arc::new(check_approval()));

    portfolio::register(&mut steps, &mut conditions);
    index_scraper::register(&mut steps, &mut conditions);
    timing_advisor::register(&mut steps, &mut conditions);
    compliance::register(&mut steps, &mut conditions);

    (steps, conditions)
}

/// Load and validate the embedded workflow documents.
pub fn load_builtin_definitions(hitl_timeout_override: Option<u64>) -> Result<Vec<WorkflowDefinition>> {
    let (steps, conditions) = default_registries();
    WORKFLOWS
        .iter()
        .map(|(_, raw)| {
            let definition = WorkflowDefinition::from_json(raw, &steps, &conditions)?;
            Ok(match hitl_timeout_override {
                Some(seconds) => definition.with_hitl_timeout(seconds),
                None => definition,
            })
        })
        .collect()
}

/// In-memory engine with all four agents registered.
pub async fn build_engine(settings: &Settings) -> Result<WorkflowEngine> {
    let engine = WorkflowEngine::open(&settings.data_dir).await?;
    for definition in load_builtin_definitions(settings.hitl_timeout_seconds)? {
        engine.register(definition).await;
    }
    info!(
        data_dir = %settings.data_dir.display(),
        workflows = ?engine.workflow_ids().await,
        "Agents loaded"
    );
    Ok(engine)
}

fn review(mut state: WorkflowState) -> StepResult {
    let note = match state.hitl.status {
        Some(DecisionStatus::Approved) => "Human review: approved".to_string(),
        Some(DecisionStatus::Rejected) => "Human review: rejected, revising".to_string(),
        Some(DecisionStatus::Timeout) => {
            "Human review: timed out, closing without approval".to_string()
        }
        Some(DecisionStatus::Bypassed) => "Human review: bypassed".to_string(),
        Some(DecisionStatus::Pending) | None => "Human review: still pending".to_string(),
    };
    let note = match &state.hitl.comment {
        Some(comment) if !comment.is_empty() => format!("{} (comment: {})", note, comment),
        _ => note,
    };
    state.record(note);
    Ok(state)
}

//
// ================= Shared helpers =================
//

pub(crate) fn put<T: Serialize>(state: &mut WorkflowState, key: &str, value: &T) -> std::result::Result<(), StepError> {
    let value = serde_json::to_value(value)
        .map_err(|e| StepError::fatal(format!("cannot store '{}': {}", key, e)))?;
    state.set(key, value);
    Ok(())
}

pub(crate) fn load<T: DeserializeOwned>(state: &WorkflowState, key: &str) -> std::result::Result<T, StepError> {
    let value = state
        .get(key)
        .ok_or_else(|| StepError::fatal(format!("'{}' has not been produced yet", key)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| StepError::fatal(format!("malformed '{}': {}", key, e)))
}

/// True when this pass follows a reviewer rejection.
pub(crate) fn revising(state: &WorkflowState) -> bool {
    state.hitl.status == Some(DecisionStatus::Rejected)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexQuote {
    pub symbol: String,
    pub price: f64,
    pub change_percent: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sentiment {
    pub fear_greed_index: f64,
    pub vix: f64,
}

/// Deterministic stand-in for the live index feed.
pub(crate) fn index_snapshot() -> Vec<IndexQuote> {
    [("S&P 500", 4847.88, 0.42), ("NASDAQ", 15181.92, 0.65), ("DOW", 37753.31, -0.12)]
        .iter()
        .map(|(symbol, price, change)| IndexQuote {
            symbol: symbol.to_string(),
            price: *price,
            change_percent: *change,
        })
        .collect()
}

/// Sentiment snapshot; inputs may pin `fear_greed_index` and `vix`.
pub(crate) fn sentiment_snapshot(state: &WorkflowState) -> Sentiment {
    Sentiment {
        fear_greed_index: state.get_f64("fear_greed_index").unwrap_or(65.0),
        vix: state.get_f64("vix").unwrap_or(13.22),
    }
}

pub(crate) fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::execution::WorkflowEngine;
    use serde_json::{Map, Value};

    pub async fn engine(dir: &tempfile::TempDir) -> WorkflowEngine {
        let engine = WorkflowEngine::in_memory(dir.path());
        for definition in super::load_builtin_definitions(None).unwrap() {
            engine.register(definition).await;
        }
        engine
    }

    pub fn inputs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::RunOptions;
    use crate::models::RunResult;

    #[test]
    fn test_builtin_workflows_validate() {
        let definitions = load_builtin_definitions(Some(45)).unwrap();
        let ids: Vec<&str> = definitions.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            [PORTFOLIO_OPTIMIZER, INDEX_SCRAPER, TIMING_ADVISOR, COMPLIANCE_LOGGER]
        );
        for definition in &definitions {
            assert_eq!(definition.config.hitl_timeout_seconds, 45);
            let approval = definition.approval.as_ref().unwrap();
            assert_eq!(approval.resolve_at, "hitl_review");
            assert!(definition.node(&approval.resolve_at).is_some());
        }
    }

    #[tokio::test]
    async fn test_pending_review_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };

        let engine = build_engine(&settings).await.unwrap();
        let result = engine
            .run(
                PORTFOLIO_OPTIMIZER,
                test_support::inputs(serde_json::json!({"budget": 150000, "risk_level": "High"})),
                RunOptions::default(),
            )
            .await
            .unwrap();
        let decision_id = match result {
            RunResult::Suspended { decision, .. } => decision.id,
            other => panic!("expected suspension, got {:?}", other),
        };
        drop(engine);

        let engine = build_engine(&settings).await.unwrap();
        assert_eq!(engine.list_pending(None).await.unwrap().len(), 1);
        assert_eq!(engine.suspended_runs().await.unwrap(), 1);

        let resolution = engine.approve(decision_id, Some("ok".into())).await.unwrap();
        assert!(matches!(resolution.outcome, Some(RunResult::Completed { .. })));
        assert_eq!(engine.suspended_runs().await.unwrap(), 0);
        drop(engine);

        let engine = build_engine(&settings).await.unwrap();
        assert!(engine.list_pending(None).await.unwrap().is_empty());
        assert_eq!(
            engine.get_decision(decision_id).await.unwrap().status,
            DecisionStatus::Approved
        );
        assert_eq!(engine.audit().read_records(PORTFOLIO_OPTIMIZER).await.unwrap().len(), 1);
    }

    #[test]
    fn test_review_note_includes_comment() {
        let mut state = WorkflowState::default();
        state.hitl.status = Some(DecisionStatus::Rejected);
        state.hitl.comment = Some("too concentrated".into());
        let state = review(state).unwrap();
        assert_eq!(
            state.trace(),
            ["Human review: rejected, revising (comment: too concentrated)".to_string()]
        );
    }
}
