use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::http::{JOB, JOBS, WORKERS};
use common::{JobGraph, JobInfo, JobStatus, JobVertex, WorkerMetrics};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// - En Docker: COORDINATOR_URL=http://coordinator:8080
/// - Local: default http://localhost:8080
fn coordinator_base_url() -> String {
    env::var("COORDINATOR_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para hablar con el coordinador")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un grafo de job leído de un archivo JSON
    Submit {
        #[arg(value_name = "GRAFO_JSON")]
        graph: PathBuf,

        /// Espera a que el job termine
        #[arg(long)]
        wait: bool,
    },
    /// Arma y envía un conteo de líneas: split_source -> count_by_key -> file_sink
    Wordcount {
        #[arg(value_name = "NOMBRE")]
        name: String,

        /// Patrón de entrada, ej: /data/input/*.txt
        #[arg(long, default_value = "/data/input/*")]
        input: String,

        /// Archivo JSONL de salida
        #[arg(long, default_value = "/data/output/wordcount.jsonl")]
        output: String,

        #[arg(long)]
        wait: bool,
    },
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Cancela un job
    Cancel {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los jobs
    Jobs,
    /// Lista los workers registrados
    Workers,
}

fn build_wordcount_graph(name: String, input: String, output: String) -> JobGraph {
    let mut g = JobGraph::new(name);
    let read = g.add_vertex(JobVertex::new("read", "split_source").with_input_glob(input));
    let agg = g.add_vertex(
        JobVertex::new("agg", "count_by_key").with_config(json!({ "key": "text" })),
    );
    let sink =
        g.add_vertex(JobVertex::new("write", "file_sink").with_config(json!({ "path": output })));
    g.connect(&read, &agg);
    g.connect(&agg, &sink);
    g
}

fn print_job(job: &JobInfo) {
    println!("Job:");
    println!("  id: {}", job.id);
    println!("  nombre: {}", job.name);
    println!("  estado: {:?}", job.status);
    println!(
        "  tareas: total={}, corriendo={}, terminadas={}, fallidas={}, canceladas={}",
        job.total_tasks,
        job.running_tasks,
        job.finished_tasks,
        job.failed_tasks,
        job.canceled_tasks
    );

    let done = job.finished_tasks + job.failed_tasks + job.canceled_tasks;
    if job.total_tasks > 0 {
        let pct = (done as f64 / job.total_tasks as f64) * 100.0;
        println!("  progreso: {:.1}%", pct);
    }
    if let Some(ref failure) = job.failure {
        println!("  falla: {}", failure);
    }
    println!("  submitted_at: {}", job.submitted_at);
    if let Some(ref finished) = job.finished_at {
        println!("  finalizado: {}", finished);
    }
}

async fn submit(client: &Client, base_url: &str, graph: &JobGraph, wait: bool) -> Result<()> {
    let url = format!("{}{}", base_url, JOBS);
    let resp = client.post(&url).json(graph).send().await?;
    if resp.status() != StatusCode::CREATED {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        bail!("el coordinador rechazó el job ({}): {}", status, body);
    }
    let job: JobInfo = resp.json().await?;
    println!("Job creado: {}", job.id);

    if !wait {
        return Ok(());
    }

    // polling hasta estado terminal
    let url = format!("{}{}", base_url, JOB.replace(":id", job.id.as_str()));
    loop {
        let job: JobInfo = client.get(&url).send().await?.json().await?;
        if matches!(
            job.status,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled
        ) {
            print_job(&job);
            if job.status != JobStatus::Finished {
                std::process::exit(1);
            }
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = coordinator_base_url();

    match cli.command {
        Commands::Submit { graph, wait } => {
            let text = fs::read_to_string(&graph)
                .with_context(|| format!("no se pudo leer {}", graph.display()))?;
            let graph: JobGraph = serde_json::from_str(&text)
                .with_context(|| format!("grafo inválido en {}", graph.display()))?;
            submit(&client, &base_url, &graph, wait).await?;
        }

        Commands::Wordcount {
            name,
            input,
            output,
            wait,
        } => {
            let graph = build_wordcount_graph(name, input, output);
            submit(&client, &base_url, &graph, wait).await?;
        }

        Commands::Status { id } => {
            let url = format!("{}{}", base_url, JOB.replace(":id", &id));
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                print_job(&job);
            } else {
                println!("Error: job no encontrado (status {})", resp.status());
            }
        }

        Commands::Cancel { id } => {
            let url = format!("{}{}", base_url, JOB.replace(":id", &id));
            let resp = client.delete(&url).send().await?;
            if resp.status() == StatusCode::ACCEPTED {
                println!("Cancelación pedida para {}", id);
            } else {
                println!("No se pudo cancelar {} (status {})", id, resp.status());
            }
        }

        Commands::Jobs => {
            let url = format!("{}{}", base_url, JOBS);
            let jobs: Vec<JobInfo> = client.get(&url).send().await?.json().await?;
            if jobs.is_empty() {
                println!("No hay jobs.");
            }
            for job in jobs {
                println!(
                    "{}  {:?}  {}/{}  {}",
                    job.id, job.status, job.finished_tasks, job.total_tasks, job.name
                );
            }
        }

        Commands::Workers => {
            let url = format!("{}{}", base_url, WORKERS);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                if workers.is_empty() {
                    println!("No hay workers registrados.");
                }
                for w in workers {
                    println!("Worker {}", w.instance);
                    println!("  host           : {}", w.hostname);
                    println!("  dead           : {}", w.dead);
                    println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                    println!(
                        "  hardware       : cores={}, mem={} B, usable={} B",
                        w.hardware.cpu_cores,
                        w.hardware.physical_memory,
                        w.hardware.usable_memory
                    );
                    println!(
                        "  tareas         : corriendo={}, desplegadas={}, ok={}, fallidas={}",
                        w.running_tasks, w.tasks_deployed, w.tasks_finished, w.tasks_failed
                    );
                    println!("  páginas libres : {}", w.free_memory_pages);
                    println!();
                }
            } else {
                println!("Error consultando {} (status {})", WORKERS, resp.status());
            }
        }
    }

    Ok(())
}
