// src/main.rs
// Long-term conversation memory service: MCP stdio entry point.

use anyhow::Result;
use memnon::config::Config;
use memnon::mcp::MemoryServer;
use memnon::orchestrator::Orchestrator;
use rmcp::ServiceExt;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting memory service MCP server");
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    let ingest_url = config.ingest_url.clone();

    let orchestrator = Arc::new(Orchestrator::init(config).await?);
    info!("orchestrator initialised, serving over stdio");
    tokio::spawn(memnon::orchestrator::run_queue_drain(orchestrator.clone(), ingest_url));

    let server = MemoryServer::new(orchestrator);
    let service = server.serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;

    Ok(())
}
