use std::time::Instant;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordinator::Coordinator;

/// Barre la tabla de workers cada `monitor_interval`. Los que pasaron
/// `worker_dead_timeout` sin heartbeat se marcan muertos y sus tareas fallan.
pub async fn monitor_workers(coordinator: Coordinator, shutdown: CancellationToken) {
    let mut ticker = interval(coordinator.config().monitor_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let dead = coordinator.mark_dead_workers(Instant::now());
        if dead.is_empty() {
            continue;
        }

        info!("{} workers perdidos, fallando sus tareas", dead.len());
        coordinator.handle_lost_workers(&dead).await;
    }
    debug!("monitor de workers terminado");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::coordinator::tests::{heartbeat, FakeConnector};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn silent_worker_is_marked_dead_by_the_loop() {
        let config = CoordinatorConfig {
            worker_dead_timeout: Duration::from_millis(100),
            monitor_interval: Duration::from_millis(20),
            ..CoordinatorConfig::default()
        };
        let c = Coordinator::with_connector(config, Arc::new(FakeConnector::default()));
        c.heartbeat(heartbeat(10));

        let stop = CancellationToken::new();
        let task = tokio::spawn(monitor_workers(c.clone(), stop.clone()));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(c.registered_workers(), 0);
        assert!(c.workers()[0].dead);

        stop.cancel();
        task.await.unwrap();
    }
}
