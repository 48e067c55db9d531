//! Market timing advisor
//!
//! Scores simple technical indicators per index into buy and sell signals,
//! then combines them with the volatility and sentiment regime into one
//! overall call. Strong calls, extreme regimes and low confidence go to a
//! human.

use super::{index_snapshot, load, put, revising, round2, sentiment_snapshot, IndexQuote, Sentiment};
use crate::hitl::approval_gate;
use crate::state::WorkflowState;
use crate::steps::{ConditionRegistry, StepError, StepRegistry, StepResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub const MIN_CONFIDENCE: f64 = 60.0;
const TIMEFRAMES: [&str; 3] = ["short", "medium", "long"];

pub fn register(steps: &mut StepRegistry, conditions: &mut ConditionRegistry) {
    steps.register_fn("timing.analyze_timeframe", analyze_timeframe);
    steps.register_fn("timing.collect_market_data", collect_market_data);
    steps.register_fn("timing.calculate_technical_indicators", calculate_technical_indicators);
    steps.register_fn("timing.generate_timing_signals", generate_timing_signals);
    steps.register_fn("timing.determine_market_regime", determine_market_regime);
    steps.register_fn("timing.reason_about_timing", reason_about_timing);
    steps.register_fn("timing.finalize_recommendations", finalize_recommendations);

    conditions.register(
        "timing.should_require_approval",
        Arc::new(approval_gate(requires_review)),
    );
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indicators {
    pub symbol: String,
    pub change_percent: f64,
    pub momentum: String,
    pub trend: String,
    pub volume: String,
    pub rsi: f64,
    pub rsi_signal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub recommendation: String,
    pub score: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRegime {
    pub market_regime: String,
    pub volatility_regime: String,
    pub sentiment_regime: String,
    pub market_phase: String,
    pub description: String,
}

fn analyze_timeframe(mut state: WorkflowState) -> StepResult {
    let timeframe = state.get_str("timeframe").unwrap_or("medium").to_ascii_lowercase();
    if !TIMEFRAMES.contains(&timeframe.as_str()) {
        return Err(StepError::fatal(format!(
            "timeframe must be one of {}, got '{}'",
            TIMEFRAMES.join(", "),
            timeframe
        )));
    }
    let depth = state.get_str("analysis_depth").unwrap_or("standard").to_string();

    state.record(format!("Analyze Timeframe: {} horizon, {} analysis", timeframe, depth));
    state.set("timeframe", json!(timeframe));
    state.set("analysis_depth", json!(depth));
    Ok(state)
}

fn collect_market_data(mut state: WorkflowState) -> StepResult {
    let indices = index_snapshot();
    let sentiment = sentiment_snapshot(&state);
    state.record(format!(
        "Collect Market Data: {} indices, fear/greed {}, VIX {}",
        indices.len(),
        sentiment.fear_greed_index,
        sentiment.vix
    ));
    put(&mut state, "indices", &indices)?;
    put(&mut state, "sentiment", &sentiment)?;
    Ok(state)
}

fn indicators_for(quote: &IndexQuote) -> Indicators {
    let change = quote.change_percent;
    let momentum = if change > 0.5 {
        "bullish"
    } else if change < -0.5 {
        "bearish"
    } else {
        "neutral"
    };
    let trend = if change > 0.0 { "bullish" } else { "bearish" };
    let volume = if change.abs() > 0.3 { "strong" } else { "weak" };
    let rsi = round2(50.0 + change * 10.0);
    let rsi_signal = if rsi < 35.0 {
        "oversold"
    } else if rsi > 65.0 {
        "overbought"
    } else {
        "neutral"
    };

    Indicators {
        symbol: quote.symbol.clone(),
        change_percent: change,
        momentum: momentum.to_string(),
        trend: trend.to_string(),
        volume: volume.to_string(),
        rsi,
        rsi_signal: rsi_signal.to_string(),
    }
}

fn calculate_technical_indicators(mut state: WorkflowState) -> StepResult {
    let indices: Vec<IndexQuote> = load(&state, "indices")?;
    let indicators: Vec<Indicators> = indices.iter().map(indicators_for).collect();

    let summary: Vec<String> = indicators
        .iter()
        .map(|i| format!("{} momentum {} RSI {}", i.symbol, i.momentum, i.rsi))
        .collect();
    state.record(format!("Calculate Technical Indicators: {}", summary.join("; ")));
    put(&mut state, "technical_indicators", &indicators)?;
    Ok(state)
}

fn score(indicators: &Indicators) -> f64 {
    let direction = |label: &str| match label {
        "bullish" => 1.0,
        "bearish" => -1.0,
        _ => 0.0,
    };
    let volume = if indicators.volume == "strong" { 0.5 } else { -0.5 };
    let rsi = match indicators.rsi_signal.as_str() {
        "oversold" => 1.0,
        "overbought" => -1.0,
        _ => 0.0,
    };
    direction(&indicators.momentum) + direction(&indicators.trend) + volume + rsi
}

fn recommendation(score: f64) -> &'static str {
    if score > 1.0 {
        "STRONG_BUY"
    } else if score > 0.0 {
        "BUY"
    } else if score < -1.0 {
        "STRONG_SELL"
    } else if score < 0.0 {
        "SELL"
    } else {
        "HOLD"
    }
}

/// Reviewers who reject a call get a tempered one back.
fn temper(recommendation: &str) -> &str {
    match recommendation {
        "STRONG_BUY" => "BUY",
        "STRONG_SELL" => "SELL",
        other => other,
    }
}

fn generate_timing_signals(mut state: WorkflowState) -> StepResult {
    let indicators: Vec<Indicators> = load(&state, "technical_indicators")?;
    let tempered = revising(&state);

    let signals: Vec<Signal> = indicators
        .iter()
        .map(|i| {
            let score = score(i);
            let call = recommendation(score);
            Signal {
                symbol: i.symbol.clone(),
                recommendation: if tempered { temper(call) } else { call }.to_string(),
                score,
                confidence: round2((i.change_percent.abs() * 15.0 + 60.0).min(95.0)),
            }
        })
        .collect();

    let summary: Vec<String> = signals
        .iter()
        .map(|s| format!("{} {} ({}%)", s.symbol, s.recommendation, s.confidence))
        .collect();
    state.record(format!(
        "Generate Timing Signals: {}{}",
        summary.join(", "),
        if tempered { " (strong calls tempered after rejection)" } else { "" }
    ));
    put(&mut state, "signals", &signals)?;
    Ok(state)
}

fn determine_market_regime(mut state: WorkflowState) -> StepResult {
    let sentiment: Sentiment = load(&state, "sentiment")?;
    let indices: Vec<IndexQuote> = load(&state, "indices")?;
    let average_change = indices.iter().map(|q| q.change_percent).sum::<f64>() / indices.len().max(1) as f64;

    let market_regime = if sentiment.vix < 15.0 && average_change > 0.0 {
        "low_volatility_bullish"
    } else if sentiment.vix > 25.0 && average_change < 0.0 {
        "high_volatility_bearish"
    } else if sentiment.vix > 20.0 {
        "high_volatility"
    } else {
        "normal_volatility"
    };
    let volatility_regime = if sentiment.vix > 25.0 { "high_volatility" } else { "normal" };
    let sentiment_regime = if sentiment.fear_greed_index < 20.0 {
        "extreme_fear"
    } else if sentiment.fear_greed_index > 80.0 {
        "extreme_greed"
    } else {
        "balanced"
    };
    let market_phase = if average_change > 0.2 {
        "uptrend"
    } else if average_change < -0.2 {
        "downtrend"
    } else {
        "consolidation"
    };

    let regime = MarketRegime {
        market_regime: market_regime.to_string(),
        volatility_regime: volatility_regime.to_string(),
        sentiment_regime: sentiment_regime.to_string(),
        market_phase: market_phase.to_string(),
        description: format!(
            "{} market in {} with VIX {} and fear/greed {}",
            market_regime.replace('_', " "),
            market_phase,
            sentiment.vix,
            sentiment.fear_greed_index
        ),
    };
    state.record(format!("Determine Market Regime: {}", regime.description));
    put(&mut state, "market_regime", &regime)?;
    Ok(state)
}

fn overall_call(average_score: f64) -> &'static str {
    if average_score > 1.0 {
        "STRONG_BUY"
    } else if average_score > 0.25 {
        "BUY"
    } else if average_score < -1.0 {
        "STRONG_SELL"
    } else if average_score < -0.25 {
        "SELL"
    } else {
        "NEUTRAL"
    }
}

fn reason_about_timing(mut state: WorkflowState) -> StepResult {
    let signals: Vec<Signal> = load(&state, "signals")?;
    let sentiment: Sentiment = load(&state, "sentiment")?;
    let regime: MarketRegime = load(&state, "market_regime")?;
    if signals.is_empty() {
        return Err(StepError::fatal("no timing signals to reason about"));
    }

    let n = signals.len() as f64;
    let average_score = signals.iter().map(|s| s.score).sum::<f64>() / n;
    let mut confidence = signals.iter().map(|s| s.confidence).sum::<f64>() / n;
    if sentiment.vix > 20.0 {
        confidence -= 15.0;
    }
    let mut timing = overall_call(average_score);
    if revising(&state) {
        timing = temper(timing);
    }
    let confidence = round2(confidence);

    state.record(format!(
        "Reason About Timing: overall {} at {}% confidence ({})",
        timing, confidence, regime.market_regime
    ));
    state.set(
        "approval_description",
        json!(format!(
            "Timing recommendation {} with {}% confidence. Market regime: {}. Sentiment: {}.",
            timing, confidence, regime.market_regime, regime.sentiment_regime
        )),
    );
    state.set("overall_timing", json!(timing));
    state.set("timing_confidence", json!(confidence));
    Ok(state)
}

fn requires_review(state: &WorkflowState) -> bool {
    let timing = state.get_str("overall_timing").unwrap_or("NEUTRAL");
    let confidence = state.get_f64("timing_confidence").unwrap_or(0.0);
    let regime = |field: &str| {
        state
            .get("market_regime")
            .and_then(|r| r.get(field))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    let sentiment = regime("sentiment_regime");

    timing.contains("STRONG")
        || sentiment == "extreme_fear"
        || sentiment == "extreme_greed"
        || confidence < MIN_CONFIDENCE
        || regime("volatility_regime") == "high_volatility"
}

fn finalize_recommendations(mut state: WorkflowState) -> StepResult {
    let signals: Vec<Signal> = load(&state, "signals")?;
    let timing = state.get_str("overall_timing").unwrap_or("NEUTRAL").to_string();
    let confidence = state.get_f64("timing_confidence").unwrap_or(0.0);

    state.set(
        "final_recommendation",
        json!({
            "timing": timing,
            "confidence": confidence,
            "timeframe": state.get_str("timeframe").unwrap_or("medium"),
            "signals": signals.len(),
        }),
    );
    state.record(format!("Finalize Recommendations: {} ({}%)", timing, confidence));
    Ok(state)
}
