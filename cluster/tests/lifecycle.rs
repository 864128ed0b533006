use cluster::{ClusterConfig, ClusterError, LocalCluster};
use common::{JobGraph, JobVertex};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use worker::{Invokable, InvokableRegistry, SilentHeartbeat, TaskContext};

fn config() -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.worker.memory_size_mb = Some(16);
    config.worker.heartbeat_interval = Duration::from_millis(200);
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn start_registers_every_worker_and_stop_is_idempotent() {
    let mut cluster = LocalCluster::new(config());
    cluster.start(2).await.unwrap();

    assert!(cluster.is_running());
    assert_eq!(cluster.workers().len(), 2);
    assert_eq!(cluster.coordinator().unwrap().registered_workers(), 2);

    cluster.stop().await.unwrap();
    assert!(!cluster.is_running());
    assert!(cluster.workers().is_empty());

    // segunda vez: no hace nada
    cluster.stop().await.unwrap();
    assert!(!cluster.is_running());
}

#[tokio::test(flavor = "multi_thread")]
async fn start_while_running_keeps_the_same_cluster() {
    let mut cluster = LocalCluster::new(config());
    cluster.start(1).await.unwrap();
    let url = cluster.coordinator_url().unwrap();

    cluster.start(3).await.unwrap();
    assert_eq!(cluster.workers().len(), 1);
    assert_eq!(cluster.coordinator_url().unwrap(), url);

    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_worker_makes_startup_time_out() {
    let mut cluster =
        LocalCluster::new(config()).with_fault_policy(1, Arc::new(SilentHeartbeat::new()));

    let t0 = Instant::now();
    let err = cluster.start(3).await.unwrap_err();
    let waited = t0.elapsed();

    match err {
        ClusterError::StartupTimeout {
            expected,
            registered,
            ..
        } => {
            assert_eq!(expected, 3);
            assert_eq!(registered, 2);
        }
        other => panic!("esperaba StartupTimeout, llegó {:?}", other),
    }
    assert!(waited.as_millis() >= 6000, "esperó sólo {:?}", waited);
    assert!(!cluster.is_running());
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_without_cluster_is_rejected() {
    let cluster = LocalCluster::new(config());
    let mut g = JobGraph::new("nada");
    g.add_vertex(JobVertex::new("src", "sequence_source").with_config(json!({ "count": 1 })));

    assert!(matches!(
        cluster.submit_job(g).await,
        Err(ClusterError::NotRunning)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn killed_worker_goes_down_alone() {
    use common::WorkerProtocol;

    let mut cluster = LocalCluster::new(config());
    cluster.start(2).await.unwrap();

    let victim = cluster.workers()[0].clone();
    victim.kill_agent_process().await.unwrap();

    let t0 = Instant::now();
    while !victim.is_shut_down() {
        assert!(t0.elapsed().as_secs() < 5, "el worker no se apagó");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(!cluster.workers()[1].is_shut_down());

    cluster.stop().await.unwrap();
}

/// Ignora la cancelación.
struct Stubborn;

impl Invokable for Stubborn {
    fn invoke(&mut self, _ctx: &mut TaskContext) -> anyhow::Result<()> {
        std::thread::sleep(Duration::from_secs(3));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_stop_still_brings_the_worker_down() {
    let registry = InvokableRegistry::with_builtins();
    registry.register("stubborn", |_| Ok(Box::new(Stubborn)));

    let mut config = config();
    config.join_bound = Duration::from_millis(300);
    let mut cluster = LocalCluster::new(config).with_registry(Arc::new(registry));
    cluster.start(1).await.unwrap();
    let worker = cluster.workers()[0].clone();

    let mut g = JobGraph::new("terco");
    g.add_vertex(JobVertex::new("terco", "stubborn"));
    cluster.coordinator().unwrap().start_job(g).unwrap();

    let t0 = Instant::now();
    while worker.running_tasks() == 0 {
        assert!(t0.elapsed().as_secs() < 5, "la tarea no llegó al worker");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // el margen del worker es más largo que las cotas del clúster
    assert!(matches!(
        cluster.stop().await,
        Err(ClusterError::ShutdownTimeout)
    ));
    assert!(!cluster.is_running());
    assert!(!worker.is_shut_down());

    tokio::time::timeout(Duration::from_secs(5), worker.stopped())
        .await
        .unwrap();
    assert!(worker.is_shut_down());
}
