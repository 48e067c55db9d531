//! Compliance logger
//!
//! Checks a book of positions and the day's trade orders against fixed
//! limits. Every finding becomes a violation entry, which the audit layer
//! also copies into the agent's violations log.

use super::{load, put, revising};
use crate::hitl::approval_gate;
use crate::state::WorkflowState;
use crate::steps::{ConditionRegistry, StepError, StepRegistry, StepResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

pub const MIN_COMPLIANCE_SCORE: f64 = 80.0;
const MAX_VIOLATION_TYPES: usize = 3;
const SCOPES: [&str; 3] = ["full", "positions", "trades"];

pub fn register(steps: &mut StepRegistry, conditions: &mut ConditionRegistry) {
    steps.register_fn("compliance.load_compliance_rules", load_compliance_rules);
    steps.register_fn("compliance.collect_portfolio_data", collect_portfolio_data);
    steps.register_fn("compliance.analyze_trade_orders", analyze_trade_orders);
    steps.register_fn("compliance.check_position_limits", check_position_limits);
    steps.register_fn("compliance.assess_risk_compliance", assess_risk_compliance);
    steps.register_fn("compliance.detect_violations", detect_violations);
    steps.register_fn("compliance.reason_about_compliance", reason_about_compliance);
    steps.register_fn("compliance.finalize_compliance_report", finalize_compliance_report);

    conditions.register(
        "compliance.should_require_approval",
        Arc::new(approval_gate(requires_review)),
    );
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceRules {
    pub max_single_position: f64,
    pub max_sector: f64,
    pub max_daily_volume: f64,
    pub max_var: f64,
    pub suspicious_trade_value: f64,
}

impl Default for ComplianceRules {
    fn default() -> Self {
        Self {
            max_single_position: 0.25,
            max_sector: 0.40,
            max_daily_volume: 1_000_000.0,
            max_var: 0.05,
            suspicious_trade_value: 50_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub sector: String,
    pub value: f64,
    pub pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOrder {
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub price: f64,
}

impl TradeOrder {
    fn value(&self) -> f64 {
        self.quantity * self.price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub violation_type: String,
    pub severity: Severity,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

impl Violation {
    fn new(kind: &str, severity: Severity, description: String, symbol: Option<&str>) -> Self {
        Self {
            violation_type: kind.to_string(),
            severity,
            description,
            symbol: symbol.map(str::to_string),
        }
    }
}

fn demo_book() -> Vec<Holding> {
    [
        ("AAPL", "Technology", 45_000.0, 1_200.0),
        ("MSFT", "Technology", 30_000.0, 800.0),
        ("JNJ", "Healthcare", 15_000.0, -200.0),
        ("JPM", "Financials", 10_000.0, 300.0),
    ]
    .iter()
    .map(|(symbol, sector, value, pnl)| Holding {
        symbol: symbol.to_string(),
        sector: sector.to_string(),
        value: *value,
        pnl: *pnl,
    })
    .collect()
}

fn demo_orders() -> Vec<TradeOrder> {
    vec![
        TradeOrder {
            symbol: "AAPL".into(),
            side: "buy".into(),
            quantity: 100.0,
            price: 190.0,
        },
        TradeOrder {
            symbol: "MSFT".into(),
            side: "buy".into(),
            quantity: 50.0,
            price: 410.0,
        },
    ]
}

/// Input override or the built-in sample.
fn supplied<T: serde::de::DeserializeOwned>(
    state: &WorkflowState,
    key: &str,
    fallback: fn() -> Vec<T>,
) -> Result<Vec<T>, StepError> {
    match state.get(key) {
        None | Some(Value::Null) => Ok(fallback()),
        Some(_) => load(state, key),
    }
}

fn load_compliance_rules(mut state: WorkflowState) -> StepResult {
    let scope = state.get_str("monitoring_scope").unwrap_or("full").to_string();
    if !SCOPES.contains(&scope.as_str()) {
        return Err(StepError::fatal(format!("unknown monitoring scope '{}'", scope)));
    }
    let rules = ComplianceRules::default();

    state.record(format!(
        "Load Compliance Rules: {} scope, single position <= {}%, sector <= {}%, VaR <= {}%",
        scope,
        rules.max_single_position * 100.0,
        rules.max_sector * 100.0,
        rules.max_var * 100.0
    ));
    state.set("monitoring_scope", json!(scope));
    put(&mut state, "compliance_rules", &rules)?;
    Ok(state)
}

fn collect_portfolio_data(mut state: WorkflowState) -> StepResult {
    let book = supplied(&state, "positions", demo_book)?;
    let orders = supplied(&state, "trade_orders", demo_orders)?;
    let total: f64 = book.iter().map(|h| h.value).sum();

    state.record(format!(
        "Collect Portfolio Data: {} positions worth ${:.0}, {} trade orders",
        book.len(),
        total,
        orders.len()
    ));
    put(&mut state, "positions", &book)?;
    put(&mut state, "trade_orders", &orders)?;
    state.set("portfolio_value", json!(total));
    Ok(state)
}

fn scope_includes(state: &WorkflowState, part: &str) -> bool {
    matches!(state.get_str("monitoring_scope"), Some("full") | None) || state.get_str("monitoring_scope") == Some(part)
}

fn analyze_trade_orders(mut state: WorkflowState) -> StepResult {
    let mut findings = Vec::new();
    if scope_includes(&state, "trades") {
        let rules: ComplianceRules = load(&state, "compliance_rules")?;
        let orders: Vec<TradeOrder> = load(&state, "trade_orders")?;

        for order in orders.iter().filter(|o| o.value() > rules.suspicious_trade_value) {
            findings.push(Violation::new(
                "LARGE_TRADE",
                Severity::Medium,
                format!("{} {} of ${:.0} exceeds ${:.0}", order.side, order.symbol, order.value(), rules.suspicious_trade_value),
                Some(&order.symbol),
            ));
        }
        let volume: f64 = orders.iter().map(TradeOrder::value).sum();
        if volume > rules.max_daily_volume {
            findings.push(Violation::new(
                "DAILY_VOLUME",
                Severity::High,
                format!("daily volume ${:.0} exceeds ${:.0}", volume, rules.max_daily_volume),
                None,
            ));
        }
        state.record(format!(
            "Analyze Trade Orders: ${:.0} traded, {} findings",
            volume,
            findings.len()
        ));
    } else {
        state.record("Analyze Trade Orders: skipped for this scope");
    }
    put(&mut state, "trade_findings", &findings)?;
    Ok(state)
}

fn check_position_limits(mut state: WorkflowState) -> StepResult {
    let mut findings = Vec::new();
    if scope_includes(&state, "positions") {
        let rules: ComplianceRules = load(&state, "compliance_rules")?;
        let book: Vec<Holding> = load(&state, "positions")?;
        let total = state.get_f64("portfolio_value").unwrap_or(0.0);
        if total <= 0.0 {
            return Err(StepError::fatal("portfolio value must be positive"));
        }

        for holding in &book {
            let weight = holding.value / total;
            if weight > rules.max_single_position {
                findings.push(Violation::new(
                    "POSITION_CONCENTRATION",
                    Severity::Medium,
                    format!("{} is {:.1}% of the portfolio", holding.symbol, weight * 100.0),
                    Some(&holding.symbol),
                ));
            }
        }

        let mut sectors: BTreeMap<&str, f64> = BTreeMap::new();
        for holding in &book {
            *sectors.entry(holding.sector.as_str()).or_default() += holding.value;
        }
        for (sector, value) in sectors {
            let weight = value / total;
            if weight > rules.max_sector {
                findings.push(Violation::new(
                    "SECTOR_CONCENTRATION",
                    Severity::Low,
                    format!("{} sector is {:.1}% of the portfolio", sector, weight * 100.0),
                    None,
                ));
            }
        }
        state.record(format!("Check Position Limits: {} findings", findings.len()));
    } else {
        state.record("Check Position Limits: skipped for this scope");
    }
    put(&mut state, "position_findings", &findings)?;
    Ok(state)
}

fn assess_risk_compliance(mut state: WorkflowState) -> StepResult {
    let rules: ComplianceRules = load(&state, "compliance_rules")?;
    let book: Vec<Holding> = load(&state, "positions")?;
    let total = state.get_f64("portfolio_value").unwrap_or(0.0);
    let pnl: f64 = book.iter().map(|h| h.pnl).sum();
    let exposure = if total > 0.0 { pnl.abs() / total } else { 0.0 };

    let mut findings = Vec::new();
    if exposure > rules.max_var {
        findings.push(Violation::new(
            "PORTFOLIO_RISK",
            Severity::High,
            format!(
                "P&L swing of {:.1}% exceeds the {:.1}% VaR limit",
                exposure * 100.0,
                rules.max_var * 100.0
            ),
            None,
        ));
    }

    state.record(format!(
        "Assess Risk Compliance: P&L ${:.0}, exposure {:.2}% against {:.2}% limit",
        pnl,
        exposure * 100.0,
        rules.max_var * 100.0
    ));
    put(&mut state, "risk_findings", &findings)?;
    Ok(state)
}

fn compliance_score(violations: &[Violation]) -> f64 {
    let any = |kind: &str| violations.iter().any(|v| v.violation_type == kind);
    let mut score = 100.0;
    if any("POSITION_CONCENTRATION") {
        score -= 15.0;
    }
    if any("SECTOR_CONCENTRATION") {
        score -= 5.0;
    }
    if any("PORTFOLIO_RISK") {
        score -= 20.0;
    }
    if any("DAILY_VOLUME") {
        score -= 20.0;
    }
    score -= 5.0 * violations.iter().filter(|v| v.violation_type == "LARGE_TRADE").count() as f64;
    score.max(0.0)
}

fn detect_violations(mut state: WorkflowState) -> StepResult {
    let mut violations: Vec<Violation> = Vec::new();
    for key in ["position_findings", "risk_findings", "trade_findings"] {
        violations.extend(load::<Vec<Violation>>(&state, key)?);
    }
    let score = compliance_score(&violations);

    state.record(format!(
        "Detect Violations: {} violations, compliance score {}{}",
        violations.len(),
        score,
        if revising(&state) { " (re-assessed after rejection)" } else { "" }
    ));
    put(&mut state, "violations", &violations)?;
    state.set("compliance_score", json!(score));
    Ok(state)
}

fn reason_about_compliance(mut state: WorkflowState) -> StepResult {
    let violations: Vec<Violation> = load(&state, "violations")?;
    let score = state.get_f64("compliance_score").unwrap_or(0.0);
    let worst = violations.iter().map(|v| v.severity).max();
    let risk_level = match worst {
        Some(Severity::High) => "high",
        _ if score < 90.0 => "medium",
        _ => "low",
    };
    let types: BTreeSet<&str> = violations.iter().map(|v| v.violation_type.as_str()).collect();
    let remediation: Vec<String> = types
        .iter()
        .map(|kind| match *kind {
            "POSITION_CONCENTRATION" => "Trim oversized single-name positions".to_string(),
            "SECTOR_CONCENTRATION" => "Rebalance sector weights".to_string(),
            "PORTFOLIO_RISK" => "Reduce gross exposure to bring P&L swing within VaR".to_string(),
            "LARGE_TRADE" => "Confirm large trades with the desk head".to_string(),
            "DAILY_VOLUME" => "Halt further trading for the day".to_string(),
            other => format!("Investigate {}", other),
        })
        .collect();

    state.record(format!(
        "Reason About Compliance: {} risk, {} violation types",
        risk_level,
        types.len()
    ));
    state.set(
        "approval_description",
        json!(format!(
            "Compliance review with {} violations. Compliance score: {}/100. Risk level: {}.",
            violations.len(),
            score,
            risk_level
        )),
    );
    state.set(
        "compliance_analysis",
        json!({
            "risk_level": risk_level,
            "violation_types": types,
            "remediation": remediation,
        }),
    );
    Ok(state)
}

fn requires_review(state: &WorkflowState) -> bool {
    let violations: Vec<Violation> = load(state, "violations").unwrap_or_default();
    let score = state.get_f64("compliance_score").unwrap_or(0.0);
    let types: BTreeSet<&str> = violations.iter().map(|v| v.violation_type.as_str()).collect();

    violations.iter().any(|v| v.severity == Severity::High)
        || score < MIN_COMPLIANCE_SCORE
        || types.len() > MAX_VIOLATION_TYPES
}

fn finalize_compliance_report(mut state: WorkflowState) -> StepResult {
    let violations: Vec<Violation> = load(&state, "violations")?;
    let score = state.get_f64("compliance_score").unwrap_or(0.0);
    let analysis = state.get("compliance_analysis").cloned().unwrap_or(Value::Null);
    let status = if violations.is_empty() { "compliant" } else { "violations_found" };

    state.set(
        "compliance_report",
        json!({
            "status": status,
            "compliance_score": score,
            "violations": violations.len(),
            "risk_level": analysis["risk_level"],
            "remediation": analysis["remediation"],
            "reviewed": state.hitl.required,
        }),
    );
    state.record(format!("Finalize Compliance Report: {} (score {})", status, score));
    Ok(state)
}
