//! Axum server setup
//!
//! Server skeleton with:
//! - Tracing middleware
//! - A per-request `Context` with the configured deadline
//! - Graceful shutdown once the shutdown context is done, bounded in time

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use txscope_core::{CancelHandle, Context};

use super::routes;
use crate::config::ServerConfig;
use crate::service::{ExampleApi, HealthCheck};

/// Shared application state
pub struct AppState {
    pub examples: Arc<dyn ExampleApi>,
    pub health: Arc<dyn HealthCheck>,
    base_ctx: Context,
    request_timeout: Duration,
    started: Instant,
}

impl AppState {
    /// State whose request contexts descend from `base_ctx`
    pub fn new(
        examples: Arc<dyn ExampleApi>,
        health: Arc<dyn HealthCheck>,
        base_ctx: Context,
        request_timeout: Duration,
    ) -> Self {
        Self {
            examples,
            health,
            base_ctx,
            request_timeout,
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fresh context for one request
    pub fn request_context(&self) -> Context {
        self.base_ctx.with_timeout(self.request_timeout)
    }
}

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::example::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server until `shutdown` is done.
///
/// In-flight requests get `config.graceful_shutdown` to finish. Requests
/// still running after that have their contexts cancelled, so their units
/// of work roll back, and `ServerError::ShutdownTimeout` is returned.
///
/// # Example
///
/// ```ignore
/// let (ctx, cancel) = Context::background().with_cancel();
/// run_server(examples, health, &config.server, ctx).await?;
/// ```
pub async fn run_server(
    examples: Arc<dyn ExampleApi>,
    health: Arc<dyn HealthCheck>,
    config: &ServerConfig,
    shutdown: Context,
) -> Result<(), ServerError> {
    let (base_ctx, abort_requests) = Context::background().with_cancel();
    let state = Arc::new(AppState::new(
        examples,
        health,
        base_ctx,
        config.request_timeout,
    ));
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", addr);

    serve(listener, app, shutdown, config.graceful_shutdown, abort_requests).await
}

async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: Context,
    grace: Duration,
    abort_requests: CancelHandle,
) -> Result<(), ServerError> {
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let reason = shutdown.done().await;
        tracing::info!(%reason, "server start graceful shutdown");
        let _ = started_tx.send(());
    });
    let mut server = std::pin::pin!(server.into_future());

    tokio::select! {
        result = &mut server => {
            result?;
            return Ok(());
        }
        _ = started_rx => {}
    }

    let started = Instant::now();
    match tokio::time::timeout(grace, server).await {
        Ok(result) => {
            result?;
            tracing::info!(elapsed = ?started.elapsed(), "server end graceful shutdown");
            Ok(())
        }
        Err(_) => {
            abort_requests.cancel();
            tracing::warn!(?grace, "graceful shutdown timed out, cancelling in-flight requests");
            Err(ServerError::ShutdownTimeout(grace))
        }
    }
}

/// Server error type
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("graceful shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}
