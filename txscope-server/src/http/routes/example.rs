//! Example endpoints

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::http::error::ApiError;
use crate::http::extractors::{ExampleId, RequestContext};
use crate::http::server::AppState;
use crate::models::{Example, ExampleName};

/// Create/update request
#[derive(Deserialize)]
pub struct ExampleRequest {
    pub name: String,
}

/// Bulk import request
#[derive(Deserialize)]
pub struct ImportRequest {
    pub names: Vec<String>,
}

#[derive(Serialize)]
pub struct ImportResponse {
    pub imported: u64,
}

/// GET /example - list all examples
async fn list_examples(
    State(state): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
) -> Result<Json<Vec<Example>>, ApiError> {
    let examples = state.examples.list(&ctx).await?;
    Ok(Json(examples))
}

/// POST /example - create an example
async fn create_example(
    State(state): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    Json(req): Json<ExampleRequest>,
) -> Result<(StatusCode, Json<Example>), ApiError> {
    let name = ExampleName::new(&req.name)?;
    let example = state.examples.create(&ctx, name).await?;

    Ok((StatusCode::CREATED, Json(example)))
}

/// POST /example/import - insert many examples atomically
async fn import_examples(
    State(state): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    Json(req): Json<ImportRequest>,
) -> Result<(StatusCode, Json<ImportResponse>), ApiError> {
    // Reject the whole request if any name is invalid
    let names = req
        .names
        .iter()
        .map(|name| ExampleName::new(name))
        .collect::<Result<Vec<_>, _>>()?;
    let imported = state.examples.import(&ctx, names).await?;

    Ok((StatusCode::CREATED, Json(ImportResponse { imported })))
}

/// GET /example/{id} - get a single example
async fn get_example(
    State(state): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    ExampleId(id): ExampleId,
) -> Result<Json<Example>, ApiError> {
    let example = state.examples.get(&ctx, id).await?;
    Ok(Json(example))
}

/// PUT /example/{id} - rename an example
async fn update_example(
    State(state): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    ExampleId(id): ExampleId,
    Json(req): Json<ExampleRequest>,
) -> Result<Json<Example>, ApiError> {
    let name = ExampleName::new(&req.name)?;
    let example = state.examples.update(&ctx, id, name).await?;
    Ok(Json(example))
}

/// Example routes
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/example", get(list_examples).post(create_example))
        .route("/example/import", post(import_examples))
        .route("/example/{id}", get(get_example).put(update_example))
}
