//! Import status endpoints
//!
//! Small unauthenticated router for operations: health, build info, and the
//! import run history. It binds on the importer's own module_config port.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sirena_common::db::models::ImportRun;
use sirena_common::pagination::{calculate_pagination, PAGE_SIZE};
use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Common(#[from] sirena_common::Error),
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Common(sirena_common::Error::Database(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Common(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(serde_json::json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: "sirena-importer".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Build information response
#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub version: String,
    pub git_hash: String,
    pub build_timestamp: String,
    pub build_profile: String,
}

/// GET /build_info
pub async fn get_build_info() -> Json<BuildInfo> {
    Json(BuildInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("GIT_HASH").to_string(),
        build_timestamp: env!("BUILD_TIMESTAMP").to_string(),
        build_profile: env!("BUILD_PROFILE").to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RunListResponse {
    pub items: Vec<ImportRun>,
    pub page: i64,
    pub total_pages: i64,
    pub total_results: i64,
}

/// GET /runs
///
/// Import run history, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<RunListResponse>> {
    let total_results: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM import_runs")
        .fetch_one(&state.db)
        .await?;

    let pagination = calculate_pagination(total_results, query.page.unwrap_or(1));

    let items = sqlx::query_as::<_, ImportRun>(
        "SELECT * FROM import_runs ORDER BY started_at DESC LIMIT ? OFFSET ?",
    )
    .bind(PAGE_SIZE)
    .bind(pagination.offset)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(RunListResponse {
        items,
        page: pagination.page,
        total_pages: pagination.total_pages,
        total_results,
    }))
}

/// GET /runs/latest
pub async fn latest_run(State(state): State<AppState>) -> ApiResult<Json<ImportRun>> {
    let run = sqlx::query_as::<_, ImportRun>(
        "SELECT * FROM import_runs ORDER BY started_at DESC LIMIT 1",
    )
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::NotFound("no import has run yet".to_string()))?;

    Ok(Json(run))
}

/// Build the status router
pub fn build_router(state: AppState) -> Router {
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", get(health_check))
        .route("/build_info", get(get_build_info))
        .route("/runs", get(list_runs))
        .route("/runs/latest", get(latest_run))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
