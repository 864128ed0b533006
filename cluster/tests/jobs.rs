use anyhow::anyhow;
use cluster::{ClusterConfig, ClusterError, LocalCluster};
use common::{ExecutionState, JobGraph, JobStatus, JobVertex};
use coordinator::CoordinatorError;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use worker::{FailOnState, Invokable, InvokableRegistry, TaskContext};

fn config() -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.worker.memory_size_mb = Some(32);
    config.worker.heartbeat_interval = std::time::Duration::from_millis(200);
    config
}

fn tmp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("cluster_{}_{}", name, unique_suffix()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn unique_suffix() -> String {
    format!(
        "{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    )
}

/// sequence_source -> forward -> file_sink
fn sequence_job(count: u64, out: &PathBuf) -> JobGraph {
    let mut g = JobGraph::new(format!("secuencia {}", count));
    let src = g.add_vertex(
        JobVertex::new("fuente", "sequence_source").with_config(json!({ "count": count })),
    );
    let fwd = g.add_vertex(JobVertex::new("reenvío", "forward"));
    let sink = g.add_vertex(
        JobVertex::new("salida", "file_sink")
            .with_config(json!({ "path": out.to_string_lossy() })),
    );
    g.connect(&src, &fwd);
    g.connect(&fwd, &sink);
    g
}

async fn run_sequence(count: u64) {
    let dir = tmp_dir("seq");
    let out = dir.join("out.jsonl");

    let mut cluster = LocalCluster::new(config());
    cluster.start(3).await.unwrap();

    let result = cluster.submit_job(sequence_job(count, &out)).await.unwrap();
    assert_eq!(result.status, JobStatus::Finished);
    assert_eq!(result.accumulators.get("records_out"), Some(&(count as i64)));
    assert_eq!(
        result.accumulators.get("records_written"),
        Some(&(count as i64))
    );

    let text = fs::read_to_string(&out).unwrap();
    let mut expected = 0u64;
    for line in text.lines() {
        assert_eq!(line.parse::<u64>().unwrap(), expected);
        expected += 1;
    }
    assert_eq!(expected, count);

    // los workers liberaron todo
    for w in cluster.workers() {
        assert_eq!(w.running_tasks(), 0);
        let mm = w.memory_manager();
        assert_eq!(mm.free_pages(), mm.total_pages());
    }

    cluster.stop().await.unwrap();
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_sequence_produces_empty_file() {
    run_sequence(0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn million_records_arrive_in_order() {
    run_sequence(1_000_000).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn word_count_over_globbed_files_spills_and_sums() {
    let dir = tmp_dir("wc");
    let input = dir.join("input");
    fs::create_dir_all(&input).unwrap();
    fs::write(input.join("a.txt"), "rojo\nazul\nrojo\nverde\n").unwrap();
    fs::write(input.join("b.txt"), "azul\nrojo\n").unwrap();
    let out = dir.join("counts.jsonl");

    let mut g = JobGraph::new("conteo");
    let src = g.add_vertex(
        JobVertex::new("lectura", "split_source")
            .with_input_glob(input.join("*.txt").to_string_lossy()),
    );
    let count = g.add_vertex(
        JobVertex::new("conteo", "count_by_key")
            .with_config(json!({ "key": "text", "max_in_memory_keys": 2 })),
    );
    let sink = g.add_vertex(
        JobVertex::new("salida", "file_sink")
            .with_config(json!({ "path": out.to_string_lossy() })),
    );
    g.connect(&src, &count);
    g.connect(&count, &sink);

    let mut cluster = LocalCluster::new(config());
    cluster.start(2).await.unwrap();
    let result = cluster.submit_job(g).await.unwrap();
    cluster.stop().await.unwrap();

    assert_eq!(result.status, JobStatus::Finished);
    assert_eq!(result.accumulators.get("records_out"), Some(&6));
    assert!(result.accumulators.get("spills").copied().unwrap_or(0) > 0);

    let rows: Vec<Value> = fs::read_to_string(&out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(
        rows,
        vec![
            json!({ "text": "azul", "count": 2 }),
            json!({ "text": "rojo", "count": 3 }),
            json!({ "text": "verde", "count": 1 }),
        ]
    );
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread")]
async fn injected_fault_reaches_the_submitter_verbatim() {
    let dir = tmp_dir("fault");
    let out = dir.join("out.jsonl");

    let mut cluster = LocalCluster::new(config()).with_fault_policy(
        0,
        Arc::new(FailOnState::new(0, ExecutionState::Running, 1)),
    );
    cluster.start(1).await.unwrap();

    let err = cluster
        .submit_job(sequence_job(100_000, &out))
        .await
        .unwrap_err();
    match err {
        ClusterError::Coordinator(CoordinatorError::JobFailed { description, .. }) => {
            assert_eq!(description, "Worker #0 failed.");
        }
        other => panic!("esperaba JobFailed, llegó {:?}", other),
    }

    let w = &cluster.workers()[0];
    assert_eq!(w.running_tasks(), 0);

    cluster.stop().await.unwrap();
    let _ = fs::remove_dir_all(&dir);
}

struct Thrower;

impl Invokable for Thrower {
    fn invoke(&mut self, _ctx: &mut TaskContext) -> anyhow::Result<()> {
        Err(anyhow!("falla intencional en código de usuario"))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn user_code_error_fails_the_job_with_its_message() {
    let registry = InvokableRegistry::with_builtins();
    registry.register("thrower", |_| Ok(Box::new(Thrower)));

    let mut cluster = LocalCluster::new(config()).with_registry(Arc::new(registry));
    cluster.start(1).await.unwrap();

    let mut g = JobGraph::new("con error");
    let src = g.add_vertex(JobVertex::new("rompe", "thrower"));
    let sink = g.add_vertex(JobVertex::new("salida", "discard_sink"));
    g.connect(&src, &sink);

    match cluster.submit_job(g).await {
        Err(ClusterError::Coordinator(CoordinatorError::JobFailed { description, .. })) => {
            assert_eq!(description, "falla intencional en código de usuario");
        }
        other => panic!("esperaba JobFailed, llegó {:?}", other.map(|r| r.status)),
    }

    cluster.stop().await.unwrap();
}
