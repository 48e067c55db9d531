//! Portfolio optimizer
//!
//! Builds a confidence-weighted allocation over a fixed candidate universe.
//! Reviews trigger on high risk, large budgets, thin diversification or
//! aggressive return targets. A rejection re-enters at the strategy step,
//! which tightens the risk multiplier for the next proposal.

use super::{load, put, revising, round2};
use crate::hitl::approval_gate;
use crate::state::WorkflowState;
use crate::steps::{ConditionRegistry, StepError, StepRegistry, StepResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub const MAX_RISK_SCORE: f64 = 2.5;
pub const MAX_UNREVIEWED_BUDGET: f64 = 100_000.0;
pub const MIN_DIVERSIFICATION: f64 = 60.0;
pub const MAX_EXPECTED_RETURN: f64 = 20.0;

const MIN_ALLOCATION: f64 = 5.0;
const MAX_ALLOCATION: f64 = 30.0;
const MAX_POSITIONS: usize = 5;

pub fn register(steps: &mut StepRegistry, conditions: &mut ConditionRegistry) {
    steps.register_fn("portfolio.analyze_inputs", analyze_inputs);
    steps.register_fn("portfolio.fetch_market_data", fetch_market_data);
    steps.register_fn("portfolio.reason_about_strategy", reason_about_strategy);
    steps.register_fn("portfolio.generate_recommendations", generate_recommendations);
    steps.register_fn("portfolio.optimize_portfolio", optimize_portfolio);
    steps.register_fn("portfolio.finalize_portfolio", finalize_portfolio);

    conditions.register(
        "portfolio.should_require_approval",
        Arc::new(approval_gate(requires_review)),
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            _ => None,
        }
    }

    fn weight(self) -> f64 {
        match self {
            RiskLevel::Low => 1.0,
            RiskLevel::Medium => 2.0,
            RiskLevel::High => 3.0,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub sector: String,
    pub price: f64,
    pub confidence: f64,
    pub risk: RiskLevel,
    pub expected_return: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    pub risk_multiplier: f64,
    pub revision: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub sector: String,
    pub allocation_pct: f64,
    pub amount: f64,
    pub shares: u64,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub risk_score: f64,
    pub expected_return: f64,
    pub diversification_score: f64,
    pub invested: f64,
    pub cash: f64,
}

fn universe() -> Vec<Candidate> {
    use RiskLevel::*;
    [
        ("AAPL", "Technology", 190.0, 0.85, Medium, 12.0),
        ("JNJ", "Healthcare", 160.0, 0.80, Low, 7.0),
        ("JPM", "Financials", 195.0, 0.78, Medium, 9.0),
        ("MSFT", "Technology", 410.0, 0.76, Medium, 11.0),
        ("XOM", "Energy", 115.0, 0.74, High, 14.0),
        ("NVDA", "Technology", 880.0, 0.70, High, 18.0),
    ]
    .iter()
    .map(|(symbol, sector, price, confidence, risk, ret)| Candidate {
        symbol: symbol.to_string(),
        sector: sector.to_string(),
        price: *price,
        confidence: *confidence,
        risk: *risk,
        expected_return: *ret,
    })
    .collect()
}

fn risk_level(state: &WorkflowState) -> Result<RiskLevel, StepError> {
    load(state, "risk_level")
}

fn analyze_inputs(mut state: WorkflowState) -> StepResult {
    let budget = state
        .get_f64("budget")
        .ok_or_else(|| StepError::fatal("budget is required"))?;
    if budget <= 0.0 {
        return Err(StepError::fatal(format!("budget must be positive, got {}", budget)));
    }

    let raw_risk = state.get_str("risk_level").unwrap_or("Medium").to_string();
    let risk = RiskLevel::parse(&raw_risk)
        .ok_or_else(|| StepError::fatal(format!("unknown risk level '{}'", raw_risk)))?;
    let timeframe = state.get_str("timeframe").unwrap_or("medium").to_string();

    put(&mut state, "risk_level", &risk)?;
    state.set("timeframe", json!(timeframe));
    state.record(format!(
        "Analyze Inputs: budget ${:.0}, {} risk tolerance, {} timeframe",
        budget, risk, timeframe
    ));
    Ok(state)
}

fn fetch_market_data(mut state: WorkflowState) -> StepResult {
    let candidates = universe();
    let sectors: BTreeSet<&str> = candidates.iter().map(|c| c.sector.as_str()).collect();
    state.record(format!(
        "Fetch Market Data: {} candidates across {} sectors",
        candidates.len(),
        sectors.len()
    ));
    put(&mut state, "market_data", &candidates)?;
    Ok(state)
}

fn reason_about_strategy(mut state: WorkflowState) -> StepResult {
    let risk = risk_level(&state)?;
    let (name, base) = match risk {
        RiskLevel::Low => ("capital_preservation", 0.8),
        RiskLevel::Medium => ("balanced_growth", 1.0),
        RiskLevel::High => ("aggressive_growth", 1.2),
    };

    let revision = state.hitl.cycles;
    let strategy = if revising(&state) {
        let previous: Strategy = load(&state, "strategy")?;
        Strategy {
            name: name.to_string(),
            risk_multiplier: round2(previous.risk_multiplier * 0.9),
            revision,
        }
    } else {
        Strategy {
            name: name.to_string(),
            risk_multiplier: base,
            revision,
        }
    };

    state.record(format!(
        "Reason About Strategy: {} with risk multiplier {}{}",
        strategy.name,
        strategy.risk_multiplier,
        if revising(&state) { " (revised after rejection)" } else { "" }
    ));
    put(&mut state, "strategy", &strategy)?;
    Ok(state)
}

fn generate_recommendations(mut state: WorkflowState) -> StepResult {
    let risk = risk_level(&state)?;
    let mut candidates: Vec<Candidate> = load(&state, "market_data")?;

    if risk == RiskLevel::Low {
        candidates.retain(|c| c.risk != RiskLevel::High);
    }
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    candidates.truncate(MAX_POSITIONS);

    if candidates.is_empty() {
        return Err(StepError::fatal("no candidates match the risk profile"));
    }

    let symbols: Vec<&str> = candidates.iter().map(|c| c.symbol.as_str()).collect();
    state.record(format!("Generate Recommendations: {}", symbols.join(", ")));
    put(&mut state, "recommendations", &candidates)?;
    Ok(state)
}

fn allocation_multiplier(user: RiskLevel, stock: RiskLevel) -> f64 {
    match (user, stock) {
        (RiskLevel::Low, RiskLevel::Low) => 1.2,
        (RiskLevel::High, RiskLevel::High) => 1.3,
        (RiskLevel::Low, RiskLevel::High) => 0.7,
        _ => 1.0,
    }
}

fn optimize_portfolio(mut state: WorkflowState) -> StepResult {
    let budget = state
        .get_f64("budget")
        .ok_or_else(|| StepError::fatal("budget is required"))?;
    let risk = risk_level(&state)?;
    let strategy: Strategy = load(&state, "strategy")?;
    let picks: Vec<Candidate> = load(&state, "recommendations")?;

    let total_confidence: f64 = picks.iter().map(|c| c.confidence).sum();
    let mut weights: Vec<f64> = picks
        .iter()
        .map(|c| {
            let raw = c.confidence / total_confidence
                * 100.0
                * allocation_multiplier(risk, c.risk)
                * strategy.risk_multiplier;
            raw.clamp(MIN_ALLOCATION, MAX_ALLOCATION)
        })
        .collect();

    let total_weight: f64 = weights.iter().sum();
    if total_weight > 100.0 {
        for w in weights.iter_mut() {
            *w = *w * 100.0 / total_weight;
        }
    }

    let positions: Vec<Position> = picks
        .iter()
        .zip(&weights)
        .map(|(c, w)| {
            let target = budget * w / 100.0;
            let shares = (target / c.price).floor() as u64;
            Position {
                symbol: c.symbol.clone(),
                sector: c.sector.clone(),
                allocation_pct: round2(*w),
                amount: round2(shares as f64 * c.price),
                shares,
                price: c.price,
            }
        })
        .collect();

    let allocated: f64 = weights.iter().sum();
    let weighted = |value: fn(&Candidate) -> f64| -> f64 {
        picks.iter().zip(&weights).map(|(c, w)| value(c) * w).sum::<f64>() / allocated
    };
    let sectors: BTreeSet<&str> = picks.iter().map(|c| c.sector.as_str()).collect();
    let invested: f64 = positions.iter().map(|p| p.amount).sum();

    let metrics = PortfolioMetrics {
        risk_score: round2(weighted(|c: &Candidate| c.risk.weight())),
        expected_return: round2(weighted(|c: &Candidate| c.expected_return)),
        diversification_score: (sectors.len() as f64 * 20.0).min(100.0),
        invested: round2(invested),
        cash: round2(budget - invested),
    };

    state.record(format!(
        "Optimize Portfolio: {} positions, risk score {}, expected return {}%, diversification {}",
        positions.len(),
        metrics.risk_score,
        metrics.expected_return,
        metrics.diversification_score
    ));
    state.set(
        "approval_description",
        json!(format!(
            "Portfolio of {} positions for ${:.0}: risk score {}, expected return {}%, diversification {}",
            positions.len(),
            budget,
            metrics.risk_score,
            metrics.expected_return,
            metrics.diversification_score
        )),
    );
    put(&mut state, "positions", &positions)?;
    put(&mut state, "portfolio", &metrics)?;
    Ok(state)
}

fn requires_review(state: &WorkflowState) -> bool {
    let metric = |field: &str| state.get_nested_f64("portfolio", field);
    metric("risk_score").map_or(false, |v| v > MAX_RISK_SCORE)
        || state.get_f64("budget").map_or(false, |v| v > MAX_UNREVIEWED_BUDGET)
        || metric("diversification_score").map_or(false, |v| v < MIN_DIVERSIFICATION)
        || metric("expected_return").map_or(false, |v| v > MAX_EXPECTED_RETURN)
}

fn finalize_portfolio(mut state: WorkflowState) -> StepResult {
    let metrics: PortfolioMetrics = load(&state, "portfolio")?;
    let positions: Vec<Position> = load(&state, "positions")?;
    let approval = if state.hitl.required { "human_approved" } else { "auto_approved" };

    state.set(
        "final_portfolio",
        json!({
            "positions": positions.len(),
            "invested": metrics.invested,
            "cash": metrics.cash,
            "approval": approval,
        }),
    );
    state.record(format!(
        "Finalize Portfolio: ${} invested, ${} cash ({})",
        metrics.invested, metrics.cash, approval
    ));
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::{engine, inputs};
    use crate::execution::RunOptions;
    use crate::agents::PORTFOLIO_OPTIMIZER;
    use crate::models::{DecisionStatus, RunResult};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_moderate_budget_completes_without_review() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;

        let result = engine
            .run(
                PORTFOLIO_OPTIMIZER,
                inputs(json!({"budget": 50000, "risk_level": "Medium", "timeframe": "long"})),
                RunOptions::default(),
            )
            .await
            .unwrap();

        let state = match result {
            RunResult::Completed { state, .. } => state,
            other => panic!("expected completion, got {:?}", other),
        };
        assert_eq!(state.get_nested_f64("portfolio", "diversification_score"), Some(80.0));
        assert!(state.get_nested_f64("portfolio", "risk_score").unwrap() <= MAX_RISK_SCORE);
        assert!(!state.hitl.required);
        assert_eq!(state.trace().len(), 6);

        let records = engine.audit().read_records(PORTFOLIO_OPTIMIZER).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].hitl_required);

        let csv = std::fs::read_to_string(engine.audit().table_path(PORTFOLIO_OPTIMIZER)).unwrap();
        assert!(csv.starts_with("timestamp,budget,timeframe,risk_level,num_outcomes,hitl_required\n"));
        assert!(csv.lines().nth(1).unwrap().ends_with(",50000,long,Medium,5,false"));
    }

    #[tokio::test]
    async fn test_large_budget_requires_review() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;

        let result = engine
            .run(
                PORTFOLIO_OPTIMIZER,
                inputs(json!({"budget": 150000, "risk_level": "High"})),
                RunOptions::default(),
            )
            .await
            .unwrap();

        let decision = match result {
            RunResult::Suspended { decision, .. } => decision,
            other => panic!("expected suspension, got {:?}", other),
        };
        assert_eq!(decision.decision_type, "portfolio_approval");
        assert!(decision.description.starts_with("Portfolio of 5 positions for $150000"));
        assert_eq!(decision.data["budget"], json!(150000));
    }

    #[tokio::test]
    async fn test_rejection_tightens_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;

        let first = engine
            .run(
                PORTFOLIO_OPTIMIZER,
                inputs(json!({"budget": 150000, "risk_level": "High"})),
                RunOptions::session("desk"),
            )
            .await
            .unwrap();
        let first_id = first.decision_id().unwrap();

        let resolution = engine.reject(first_id, Some("too aggressive".into())).await.unwrap();
        let second = match resolution.outcome {
            Some(RunResult::Suspended { decision, .. }) => decision,
            other => panic!("budget still needs review, got {:?}", other),
        };
        assert_eq!(second.data["strategy"]["risk_multiplier"], json!(1.08));
        assert_eq!(second.data["strategy"]["revision"], json!(1));

        let swept = engine
            .sweep_timeouts(Utc::now() + Duration::seconds(301))
            .await
            .unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].decision.status, DecisionStatus::Timeout);

        let records = engine.audit().read_records(PORTFOLIO_OPTIMIZER).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].hitl_required);
        assert_eq!(records[0].decision_outcome, Some(DecisionStatus::Timeout));
        assert!(records[0].final_state.get("final_portfolio").is_none());
    }

    #[test]
    fn test_low_risk_excludes_high_risk_names() {
        let mut state = WorkflowState::default();
        state.set("budget", json!(20000));
        state.set("risk_level", json!("low"));
        let state = analyze_inputs(state).unwrap();
        let state = fetch_market_data(state).unwrap();
        let state = reason_about_strategy(state).unwrap();
        let state = generate_recommendations(state).unwrap();

        let picks: Vec<Candidate> = load(&state, "recommendations").unwrap();
        assert_eq!(picks.len(), 4);
        assert!(picks.iter().all(|c| c.risk != RiskLevel::High));
    }

    #[test]
    fn test_invalid_inputs_are_fatal() {
        let mut state = WorkflowState::default();
        state.set("budget", json!(-5));
        assert!(!analyze_inputs(state).unwrap_err().retryable);

        let mut state = WorkflowState::default();
        state.set("budget", json!(1000));
        state.set("risk_level", json!("reckless"));
        assert!(analyze_inputs(state).unwrap_err().message.contains("reckless"));
    }
}
