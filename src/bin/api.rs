use financial_agent_workflows::{
    agents::build_engine, api::start_server, config::Settings, execution::spawn_timeout_sweeper,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;

    info!("Financial Agent Workflows - API Server");
    info!("Port: {}", settings.port);

    let engine = Arc::new(build_engine(&settings).await?);
    let sweeper = spawn_timeout_sweeper(
        engine.clone(),
        Duration::from_secs(settings.sweep_interval_secs),
    );
    info!(every_secs = settings.sweep_interval_secs, "Timeout sweeper started");

    let served = start_server(engine, settings.port).await;
    sweeper.abort();
    served
}
