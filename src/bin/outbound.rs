use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use postrelay::{Config, WorkspaceRegistry, init_tracing, run_processor, shutdown_signal};
use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;

    let database_url = config.database_url.parse().context("DATABASE_URL must be a valid URL")?;
    let db_options = PgConnectOptions::from_url(&database_url)?.application_name("postrelay-outbound");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let registry = Arc::new(
        WorkspaceRegistry::load_from_file(&config.workspace_registry_path)
            .context("failed to load workspace registry")?,
    );

    let shutdown = CancellationToken::new();
    let processor_handle = run_processor(pool, registry, &config, shutdown.clone()).await?;

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    tokio::select! {
        _ = processor_handle => {
            info!("shut down cleanly");
        }
        _ = tokio::time::sleep(Duration::from_secs(2)) => {
            tracing::warn!("stopping services takes too long, hard shutdown");
        }
    }

    Ok(())
}
