use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::shuffle::IntermediaryDataStore;
use common::subtask::SubTaskToolbox;
use worker::{execute, exit_code, load_descriptor, HttpSupervisorClient};

/// Ejecuta una sub-tarea de ingesta y reporta el resultado al supervisor.
#[derive(Debug, Parser)]
#[command(name = "worker", version)]
struct Args {
    /// Descriptor JSON de la sub-tarea.
    descriptor: PathBuf,

    /// URL base del supervisor.
    /// - En Docker usaremos: SUPERVISOR_URL=http://supervisor:8080
    #[arg(long, env = "SUPERVISOR_URL", default_value = "http://localhost:8080")]
    supervisor_url: String,

    #[arg(long, env = "INGEST_WORK_DIR", default_value = "/tmp/ingest/work")]
    work_dir: PathBuf,

    /// Directorio de particiones intermedias compartido con el supervisor.
    #[arg(long, env = "INGEST_SHUFFLE_DIR", default_value = "/tmp/ingest/shuffle")]
    shuffle_dir: PathBuf,

    #[arg(long, env = "INGEST_SEGMENT_DIR", default_value = "/tmp/ingest/segments")]
    segment_dir: PathBuf,

    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,common=info,reqwest=info")),
        )
        .init();

    let args = Args::parse();

    // Nombre de host (solo para info)
    let host = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let descriptor = load_descriptor(&args.descriptor)
        .with_context(|| format!("leyendo {}", args.descriptor.display()))?;
    info!(
        host = %host,
        task_id = %descriptor.id,
        supervisor = %descriptor.group_id,
        url = %args.supervisor_url,
        "Worker iniciado"
    );

    let client = HttpSupervisorClient::new(&args.supervisor_url, &descriptor.group_id)?;
    let store = Arc::new(IntermediaryDataStore::new(args.shuffle_dir));
    let toolbox = SubTaskToolbox::new(Arc::new(client), store, args.work_dir, args.segment_dir);

    let status = execute(&descriptor, &toolbox, Duration::from_secs(args.timeout_secs)).await;
    info!(task_id = %descriptor.id, ?status, "Worker terminado");
    std::process::exit(exit_code(&status));
}
