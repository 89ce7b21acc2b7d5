// src/bin/httpd.rs
// Long-term conversation memory service: local HTTP API entry point.

use anyhow::Result;
use memnon::config::Config;
use memnon::http::{router, AppState};
use memnon::orchestrator::Orchestrator;
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

    info!("starting memory service HTTP API");
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    let bind_addr = config.http_bind_addr.clone();
    let ingest_url = config.ingest_url.clone();

    let orchestrator = Arc::new(Orchestrator::init(config).await?);
    info!("orchestrator initialised, listening on {bind_addr}");
    tokio::spawn(memnon::orchestrator::run_queue_drain(orchestrator.clone(), ingest_url));

    let state = Arc::new(AppState::new(orchestrator));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
