use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::CoordinatorConfig;
use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;
use crate::handlers;
use crate::monitor;

/// Coordinador corriendo: servidor HTTP + monitor de workers.
pub struct CoordinatorHandle {
    coordinator: Coordinator,
    local_addr: SocketAddr,
    server: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

/// Abre el puerto de `config.bind_addr` y lanza servidor y monitor.
pub async fn spawn(config: CoordinatorConfig) -> Result<CoordinatorHandle, CoordinatorError> {
    spawn_with(Coordinator::new(config)).await
}

pub async fn spawn_with(coordinator: Coordinator) -> Result<CoordinatorHandle, CoordinatorError> {
    let listener = TcpListener::bind(coordinator.config().bind_addr).await?;
    let local_addr = listener.local_addr()?;

    let app = handlers::build_router(coordinator.clone());
    let stop = coordinator.shutdown_token();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await });
        if let Err(e) = serve.await {
            warn!("servidor HTTP del coordinador terminó con error: {}", e);
        }
    });

    let monitor = tokio::spawn(monitor::monitor_workers(
        coordinator.clone(),
        coordinator.shutdown_token(),
    ));

    info!("coordinador escuchando en {}", local_addr);
    Ok(CoordinatorHandle {
        coordinator,
        local_addr,
        server,
        monitor,
    })
}

impl CoordinatorHandle {
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Apaga el coordinador y espera a servidor y monitor hasta `bound`.
    /// `false` si alguno no terminó a tiempo.
    pub async fn stop(self, bound: Duration) -> bool {
        self.coordinator.shutdown();
        let joined = tokio::time::timeout(bound, async {
            let _ = self.server.await;
            let _ = self.monitor.await;
        })
        .await;
        if joined.is_err() {
            warn!("el coordinador no terminó en {:?}", bound);
        }
        joined.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CoordinatorProtocol, HttpCoordinatorClient};

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_the_worker_protocol_and_stops() {
        let config = CoordinatorConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..CoordinatorConfig::default()
        };
        let handle = spawn(config).await.unwrap();

        let client = HttpCoordinatorClient::new(handle.url());
        client
            .send_heartbeat(crate::coordinator::tests::heartbeat(10))
            .await
            .unwrap();
        assert_eq!(handle.coordinator().registered_workers(), 1);

        assert!(handle.stop(Duration::from_secs(2)).await);
    }
}
