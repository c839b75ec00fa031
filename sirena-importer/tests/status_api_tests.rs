//! Integration tests for the importer status API
//!
//! Covers /health, /build_info, and the import run history endpoints
//! against a real temp-file database.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use sirena_common::db::init_database;
use sirena_importer::api::{build_router, AppState};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tower::util::ServiceExt;

// ============================================================================
// Test helpers
// ============================================================================

async fn setup() -> (TempDir, SqlitePool, Router) {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("sirena.db");
    let pool = init_database(&db_path).await.unwrap();
    let app = build_router(AppState { db: pool.clone() });
    (dir, pool, app)
}

/// Insert a finished import run started `minutes_ago` minutes in the past.
async fn seed_run(pool: &SqlitePool, id: &str, minutes_ago: i64, status: &str) {
    let started = Utc::now() - ChronoDuration::minutes(minutes_ago);
    let ended = started + ChronoDuration::seconds(30);
    sqlx::query(
        "INSERT INTO import_runs \
         (id, started_at, ended_at, status, dossiers_seen, created, updated, skipped, unrouted, failed, error) \
         VALUES (?, ?, ?, ?, 10, 4, 3, 2, 1, 0, NULL)",
    )
    .bind(id)
    .bind(started)
    .bind(ended)
    .bind(status)
    .execute(pool)
    .await
    .unwrap();
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Health and build info
// ============================================================================

#[tokio::test]
async fn test_health() {
    let (_dir, _pool, app) = setup().await;

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "sirena-importer");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_build_info() {
    let (_dir, _pool, app) = setup().await;

    let response = app.oneshot(get("/build_info")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["git_hash"].is_string());
    assert!(body["build_timestamp"].is_string());
    assert!(body["build_profile"].is_string());
}

// ============================================================================
// Run history
// ============================================================================

#[tokio::test]
async fn test_runs_empty() {
    let (_dir, _pool, app) = setup().await;

    let response = app.oneshot(get("/runs")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 0);
    assert_eq!(body["total_results"], 0);
    assert_eq!(body["total_pages"], 0);
    assert_eq!(body["page"], 1);
}

#[tokio::test]
async fn test_runs_newest_first() {
    let (_dir, pool, app) = setup().await;
    seed_run(&pool, "run-old", 120, "SUCCEEDED").await;
    seed_run(&pool, "run-mid", 60, "FAILED").await;
    seed_run(&pool, "run-new", 5, "SUCCEEDED").await;

    let response = app.oneshot(get("/runs")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["total_results"], 3);
    let ids: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["run-new", "run-mid", "run-old"]);
}

#[tokio::test]
async fn test_runs_include_counters() {
    let (_dir, pool, app) = setup().await;
    seed_run(&pool, "run-1", 10, "SUCCEEDED").await;

    let response = app.oneshot(get("/runs")).await.unwrap();
    let body = extract_json(response.into_body()).await;

    let run = &body["items"][0];
    assert_eq!(run["status"], "SUCCEEDED");
    assert_eq!(run["dossiers_seen"], 10);
    assert_eq!(run["created"], 4);
    assert_eq!(run["updated"], 3);
    assert_eq!(run["skipped"], 2);
    assert_eq!(run["unrouted"], 1);
    assert_eq!(run["failed"], 0);
    assert!(run["error"].is_null());
    assert!(run["ended_at"].is_string());
}

#[tokio::test]
async fn test_latest_run_before_any_import() {
    let (_dir, _pool, app) = setup().await;

    let response = app.oneshot(get("/runs/latest")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_latest_run() {
    let (_dir, pool, app) = setup().await;
    seed_run(&pool, "run-old", 120, "SUCCEEDED").await;
    seed_run(&pool, "run-new", 5, "FAILED").await;

    let response = app.oneshot(get("/runs/latest")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["id"], "run-new");
    assert_eq!(body["status"], "FAILED");
}
