mod handlers;
mod state;

use anyhow::Context;
use rezstd_common::{Config, TaskManager};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

const DEFAULT_LOG_FILTER: &str = "rezstd_server=debug,rezstd_common=debug,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = Config::from_env().context("configuración inválida")?;
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!(
            "no se pudo crear el directorio de tareas {}",
            config.data_dir.display()
        )
    })?;
    info!(
        "tareas en {} (codec={}, nivel={}, memoria mínima={} bytes)",
        config.data_dir.display(),
        config.codec.binary,
        config.codec.level,
        config.min_available_memory
    );

    let bind = config.bind;
    let state = AppState::new(TaskManager::from_config(config));

    // router HTTP
    let app = handlers::build_router(state);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("no se pudo escuchar en {bind}"))?;
    info!("servidor escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
