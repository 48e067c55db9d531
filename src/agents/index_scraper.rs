//! Market index scraper

use super::{index_snapshot, load, put, revising, round2, sentiment_snapshot, IndexQuote, Sentiment};
use crate::hitl::approval_gate;
use crate::state::WorkflowState;
use crate::steps::{ConditionRegistry, StepError, StepRegistry, StepResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Sources the collector knows how to reach.
pub const KNOWN_SOURCES: [&str; 3] = ["yahoo", "alpha_vantage", "polygon"];

pub const MIN_DATA_QUALITY: f64 = 70.0;
pub const EXTREME_GREED: f64 = 80.0;
pub const EXTREME_FEAR: f64 = 20.0;

pub fn register(steps: &mut StepRegistry, conditions: &mut ConditionRegistry) {
    steps.register_fn("index.analyze_sources", analyze_sources);
    steps.register_fn("index.validate_connections", validate_connections);
    steps.register_fn("index.collect_current_data", collect_current_data);
    steps.register_fn("index.fetch_historical_data", fetch_historical_data);
    steps.register_fn("index.analyze_market_sentiment", analyze_market_sentiment);
    steps.register_fn("index.finalize_data", finalize_data);

    conditions.register(
        "index.should_require_approval",
        Arc::new(approval_gate(requires_review)),
    );
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataQuality {
    pub score: f64,
    pub connected: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub average_change: f64,
    pub direction: String,
    pub volatility_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSentiment {
    #[serde(flatten)]
    pub snapshot: Sentiment,
    pub sentiment_level: String,
}

fn analyze_sources(mut state: WorkflowState) -> StepResult {
    let sources: Vec<String> = match state.get("data_sources") {
        None | Some(Value::Null) => KNOWN_SOURCES.iter().map(|s| s.to_string()).collect(),
        Some(_) => load(&state, "data_sources")?,
    };
    if sources.is_empty() {
        return Err(StepError::fatal("at least one data source is required"));
    }
    let frequency = state.get_f64("collection_frequency").unwrap_or(30.0);

    state.record(format!(
        "Analyze Sources: {} requested ({}), every {}s",
        sources.len(),
        sources.join(", "),
        frequency
    ));
    put(&mut state, "data_sources", &sources)?;
    Ok(state)
}

fn validate_connections(mut state: WorkflowState) -> StepResult {
    let sources: Vec<String> = load(&state, "data_sources")?;
    let (connected, failed): (Vec<String>, Vec<String>) = sources
        .into_iter()
        .partition(|s| KNOWN_SOURCES.contains(&s.as_str()));

    if connected.is_empty() {
        return Err(StepError::fatal(format!(
            "none of the requested sources are reachable: {}",
            failed.join(", ")
        )));
    }

    let quality = DataQuality {
        score: round2(connected.len() as f64 / (connected.len() + failed.len()) as f64 * 100.0),
        connected,
        failed,
    };
    state.record(format!(
        "Validate Connections: {} connected, {} failed, data quality {}",
        quality.connected.len(),
        quality.failed.len(),
        quality.score
    ));
    put(&mut state, "data_quality", &quality)?;
    Ok(state)
}

fn collect_current_data(mut state: WorkflowState) -> StepResult {
    let indices = index_snapshot();
    let summary: Vec<String> = indices
        .iter()
        .map(|q| format!("{} {:+.2}%", q.symbol, q.change_percent))
        .collect();
    state.record(format!(
        "Collect Current Data: {}{}",
        summary.join(", "),
        if revising(&state) { " (re-collected after rejection)" } else { "" }
    ));
    put(&mut state, "indices", &indices)?;
    Ok(state)
}

fn fetch_historical_data(mut state: WorkflowState) -> StepResult {
    let indices: Vec<IndexQuote> = load(&state, "indices")?;
    let sentiment = sentiment_snapshot(&state);

    let average_change = indices.iter().map(|q| q.change_percent).sum::<f64>() / indices.len().max(1) as f64;
    let direction = if average_change > 0.2 {
        "up"
    } else if average_change < -0.2 {
        "down"
    } else {
        "flat"
    };
    let volatility_level = if sentiment.vix > 25.0 {
        "high"
    } else if sentiment.vix > 18.0 {
        "elevated"
    } else {
        "normal"
    };

    let trend = TrendAnalysis {
        average_change: round2(average_change),
        direction: direction.to_string(),
        volatility_level: volatility_level.to_string(),
    };
    state.record(format!(
        "Fetch Historical Data: trend {} ({:+.2}%), volatility {}",
        trend.direction, trend.average_change, trend.volatility_level
    ));
    put(&mut state, "trend_analysis", &trend)?;
    Ok(state)
}

fn sentiment_level(fear_greed: f64) -> &'static str {
    if fear_greed > EXTREME_GREED {
        "extreme_greed"
    } else if fear_greed > 55.0 {
        "greed"
    } else if fear_greed < EXTREME_FEAR {
        "extreme_fear"
    } else if fear_greed < 45.0 {
        "fear"
    } else {
        "neutral"
    }
}

fn analyze_market_sentiment(mut state: WorkflowState) -> StepResult {
    let snapshot = sentiment_snapshot(&state);
    let sentiment = MarketSentiment {
        snapshot,
        sentiment_level: sentiment_level(snapshot.fear_greed_index).to_string(),
    };
    let quality: DataQuality = load(&state, "data_quality")?;
    let indices: Vec<IndexQuote> = load(&state, "indices")?;

    state.record(format!(
        "Analyze Market Sentiment: fear/greed {} ({}), VIX {}",
        snapshot.fear_greed_index, sentiment.sentiment_level, snapshot.vix
    ));
    state.set(
        "approval_description",
        json!(format!(
            "Market data collection with {} indices. Data quality: {}/100. Market sentiment: {}.",
            indices.len(),
            quality.score,
            sentiment.sentiment_level
        )),
    );
    put(&mut state, "market_sentiment", &sentiment)?;
    Ok(state)
}

fn requires_review(state: &WorkflowState) -> bool {
    let fear_greed = state
        .get_nested_f64("market_sentiment", "fear_greed_index")
        .unwrap_or(50.0);
    let quality = state.get_nested_f64("data_quality", "score").unwrap_or(100.0);
    let volatility = state
        .get("trend_analysis")
        .and_then(|t| t.get("volatility_level"))
        .and_then(Value::as_str)
        .unwrap_or("normal");

    fear_greed > EXTREME_GREED
        || fear_greed < EXTREME_FEAR
        || quality < MIN_DATA_QUALITY
        || volatility == "high"
}

fn finalize_data(mut state: WorkflowState) -> StepResult {
    let indices: Vec<IndexQuote> = load(&state, "indices")?;
    let quality: DataQuality = load(&state, "data_quality")?;
    let sentiment: MarketSentiment = load(&state, "market_sentiment")?;

    state.set(
        "final_data",
        json!({
            "indices": indices,
            "data_quality": quality.score,
            "sentiment_level": sentiment.sentiment_level,
            "sources": quality.connected,
        }),
    );
    state.record(format!(
        "Finalize Data: {} indices from {} sources",
        indices.len(),
        quality.connected.len()
    ));
    Ok(state)
}
