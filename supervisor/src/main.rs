use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::catalog::InMemorySegmentCatalog;
use supervisor::{handlers, AppState, SupervisorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("supervisor=debug,common=info,tower_http=info")),
        )
        .init();

    let config = SupervisorConfig::from_env().context("leyendo la configuración")?;
    for dir in [&config.work_dir, &config.shuffle_dir, &config.segment_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creando el directorio {}", dir.display()))?;
    }
    info!(
        kill_rate = config.task_kill_rate,
        api_failure_rate = config.api_failure_rate,
        "Configuración cargada"
    );

    let bind_addr = config.bind_addr;
    let state = AppState::new(config, Arc::new(InMemorySegmentCatalog::new()));

    // router HTTP
    let app = handlers::build_router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {bind_addr}"))?;
    info!("supervisor escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl-C recibido, apagando");
        })
        .await?;
    Ok(())
}
