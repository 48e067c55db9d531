use financial_agent_workflows::{
    agents::{build_engine, COMPLIANCE_LOGGER, PORTFOLIO_OPTIMIZER, TIMING_ADVISOR},
    config::Settings,
    execution::RunOptions,
    models::{RunResult, RunSummary},
};
use serde_json::{json, Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn inputs(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn print_summary(title: &str, result: &RunResult) {
    let summary = RunSummary::from(result);
    println!("\n=== {} ===", title);
    println!("Run ID: {}", summary.run_id);
    println!("Status: {}", summary.status);
    if let Some(decision) = &summary.decision {
        println!("Decision: {} ({})", decision.id, decision.description);
    }
    if let Some(error) = &summary.error {
        println!("Error: {}", error);
    }
    println!("\nReasoning Trace:");
    for (i, step) in summary.reasoning_trace.iter().enumerate() {
        println!("  {}: {}", i + 1, step);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    info!(data_dir = %settings.data_dir.display(), "Financial agent workflows starting");

    let engine = build_engine(&settings).await?;

    // 1. Moderate portfolio, no review needed
    let result = engine
        .run(
            PORTFOLIO_OPTIMIZER,
            inputs(json!({"budget": 50000, "risk_level": "Medium", "timeframe": "long"})),
            RunOptions::session("demo"),
        )
        .await?;
    print_summary("PORTFOLIO (auto-approved)", &result);

    // 2. Large portfolio: suspend, reject once, then approve the revision
    let result = engine
        .run(
            PORTFOLIO_OPTIMIZER,
            inputs(json!({"budget": 250000, "risk_level": "High"})),
            RunOptions::session("demo"),
        )
        .await?;
    print_summary("PORTFOLIO (awaiting review)", &result);

    if let Some(id) = result.decision_id() {
        let rejected = engine.reject(id, Some("Reduce risk".into())).await?;
        if let Some(outcome) = &rejected.outcome {
            print_summary("PORTFOLIO (revised after rejection)", outcome);
            if let Some(next) = outcome.decision_id() {
                let approved = engine.approve(next, Some("Revision accepted".into())).await?;
                if let Some(outcome) = &approved.outcome {
                    print_summary("PORTFOLIO (approved)", outcome);
                }
            }
        }
    }

    // 3. Volatile market: timing call parked, then the session goes autonomous
    let result = engine
        .run(TIMING_ADVISOR, inputs(json!({"vix": 28})), RunOptions::session("night-desk"))
        .await?;
    print_summary("TIMING (awaiting review)", &result);
    for resolution in engine.enable_autonomous_mode("night-desk").await? {
        if let Some(outcome) = &resolution.outcome {
            print_summary("TIMING (bypassed)", outcome);
        }
    }

    let result = engine
        .run(COMPLIANCE_LOGGER, inputs(json!({"monitoring_scope": "full"})), RunOptions::default())
        .await?;
    print_summary("COMPLIANCE", &result);

    println!(
        "\nAudit files written to {} ({} decisions still pending)",
        settings.data_dir.display(),
        engine.list_pending(None).await?.len()
    );
    Ok(())
}
