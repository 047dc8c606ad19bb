use std::time::Duration;

use anyhow::Context;
use postrelay::{Config, init_tracing, run_webhook_retry_loop, shutdown_signal};
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
    let db_options = PgConnectOptions::from_url(&database_url)?.application_name("postrelay-periodic");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let shutdown = CancellationToken::new();
    let webhook_retry_handle = run_webhook_retry_loop(pool, &config, shutdown.clone());

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    tokio::select! {
        _ = webhook_retry_handle => {
            info!("shut down cleanly");
        }
        _ = tokio::time::sleep(Duration::from_secs(2)) => {
            tracing::warn!("stopping services takes too long, hard shutdown");
        }
    }

    Ok(())
}
