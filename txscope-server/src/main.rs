//! txscope-server binary
//!
//! Startup order: config, logging, shutdown signals, database, migrations,
//! HTTP server. Configuration is read from the environment and the nearest
//! `.env` file; see `config` for the variables.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::info;
use txscope_core::{CancelHandle, Context, PgDatabase, TxGetter, TxManager};

use txscope_server::db::{migrations, ExampleRepo};
use txscope_server::http::run_server;
use txscope_server::service::{DatabaseHealth, ExampleService};
use txscope_server::{logging, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    logging::init(&config.env)?;
    info!(env = %config.env, port = config.server.port, "starting txscope-server");

    let (ctx, cancel) = Context::background().with_cancel();
    tokio::spawn(cancel_on_signal(cancel));

    let db = PgDatabase::connect(
        &ctx,
        &config.database.connection_string(),
        config.database.max_connections,
    )
    .await
    .context("Failed to connect to database")?;
    let manager = TxManager::new(Arc::new(db));

    migrations::run(&ctx, &manager)
        .await
        .context("Failed to run migrations")?;

    let repo = Arc::new(ExampleRepo::new(TxGetter::new()));
    let health = Arc::new(DatabaseHealth::new(manager.clone()));
    let examples = Arc::new(ExampleService::new(repo, manager));

    // Blocks until a shutdown signal and the graceful drain
    run_server(examples, health, &config.server, ctx)
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Cancel the root context on Ctrl+C or SIGTERM.
async fn cancel_on_signal(cancel: CancelHandle) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting shutdown");
        }
    }
    cancel.cancel();
}
