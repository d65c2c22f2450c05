//! Health check endpoint

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::http::extractors::RequestContext;
use crate::http::server::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub database: DatabaseStatus,
}

#[derive(Serialize)]
pub struct DatabaseStatus {
    pub connected: bool,
}

/// GET /health - 503 while the database is unreachable
async fn health(
    State(state): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
) -> (StatusCode, Json<HealthResponse>) {
    let connected = match state.health.check_database(&ctx).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "database health check failed");
            false
        }
    };
    let (status, code) = if connected {
        ("ok", StatusCode::OK)
    } else {
        ("unavailable", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: state.uptime().as_secs(),
            database: DatabaseStatus { connected },
        }),
    )
}

/// Health routes
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;
    use txscope_core::fake::FakeDatabase;
    use txscope_core::{Context, TxGetter, TxManager};

    use super::*;
    use crate::db::ExampleRepo;
    use crate::http::build_router;
    use crate::service::{DatabaseHealth, ExampleService};

    async fn get_health(db: &FakeDatabase) -> (StatusCode, Value) {
        let manager = TxManager::new(Arc::new(db.clone()));
        let state = AppState::new(
            Arc::new(ExampleService::new(
                Arc::new(ExampleRepo::new(TxGetter::new())),
                manager.clone(),
            )),
            Arc::new(DatabaseHealth::new(manager)),
            Context::background(),
            Duration::from_secs(5),
        );
        let response = build_router(Arc::new(state))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn healthy_database_is_ok() {
        let db = FakeDatabase::new();

        let (status, body) = get_health(&db).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["database"]["connected"], true);
        assert_eq!(db.commit_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_database_is_503() {
        let db = FakeDatabase::new();
        db.fail_begin(true);

        let (status, body) = get_health(&db).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unavailable");
        assert_eq!(body["database"]["connected"], false);
    }
}
