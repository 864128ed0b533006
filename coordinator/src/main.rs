use anyhow::Result;
use common::logging;
use coordinator::CoordinatorConfig;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("coordinator=debug,axum=info,tower_http=info");

    let config = CoordinatorConfig::from_env();
    let handle = coordinator::spawn(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c recibido, apagando");
    handle.stop(Duration::from_secs(2)).await;
    Ok(())
}
