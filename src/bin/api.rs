use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wealth_workflow_orchestrator::{agent::Orchestrator, api::start_server, config::EngineConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env()?;

    info!("Wealth Workflow Orchestrator - API Server");
    info!("Port: {}", config.port);

    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);
    info!(
        workflows = orchestrator.registry().len(),
        "Orchestrator initialized"
    );

    // Handles must outlive the server; dropping one stops its schedule
    let schedules = if config.schedules_enabled {
        orchestrator.start_schedules()?
    } else {
        Vec::new()
    };
    info!(running = schedules.len(), "Recurring schedules");

    start_server(orchestrator, config.port).await?;

    for handle in &schedules {
        handle.cancel();
    }

    Ok(())
}
