use financial_agent_router::{agent::Orchestrator, api::start_server};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Financial Agent Router - API Server");
    info!("Port: {}", api_port);

    let orchestrator = Arc::new(Orchestrator::from_env()?);

    info!(agents = ?orchestrator.agents().names(), "Orchestrator initialized");

    start_server(orchestrator, api_port).await?;

    Ok(())
}
