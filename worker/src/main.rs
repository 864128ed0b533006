use anyhow::Result;
use common::logging;
use tracing::info;
use worker::{WorkerAgent, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("worker=debug,axum=info");

    let config = WorkerConfig::from_env();
    info!("conectando al coordinador en {}", config.coordinator_addr);

    let agent = WorkerAgent::start(config).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c recibido"),
        _ = agent.stopped() => {}
    }

    agent.shutdown().await;
    Ok(())
}
