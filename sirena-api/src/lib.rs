//! sirena-api library - HTTP backend for the SIRENA case-management frontend
//!
//! Serves the authenticated JSON API: requête listing and processing, user
//! and entity administration, and file uploads. Authentication is OIDC with
//! database-backed sessions.

use axum::Router;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

pub mod api;
pub mod error;
pub mod services;

use services::{ClamdClient, EntiteCache, OidcClient};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Cached entity hierarchy
    pub entites: EntiteCache,
    /// OIDC provider client
    pub oidc: Arc<OidcClient>,
    /// Upload scanner
    pub clamd: ClamdClient,
    /// Directory holding uploaded file content
    pub uploads_dir: PathBuf,
    /// Secret signing session and login-state cookies
    pub session_secret: String,
}

impl AppState {
    /// Create new application state
    pub fn new(
        db: SqlitePool,
        entites: EntiteCache,
        oidc: Arc<OidcClient>,
        clamd: ClamdClient,
        uploads_dir: PathBuf,
        session_secret: String,
    ) -> Self {
        Self {
            db,
            entites,
            oidc,
            clamd,
            uploads_dir,
            session_secret,
        }
    }
}

/// Build application router
///
/// Login, callback, health and build info are public; everything else goes
/// through the session middleware.
pub fn build_router(state: AppState) -> Router {
    use axum::extract::DefaultBodyLimit;
    use axum::middleware;
    use axum::routing::{get, patch, post};
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;

    // Protected routes (require a valid session)
    let protected = Router::new()
        .route("/api/profile", get(api::auth::get_profile))
        .route("/api/auth/logout", post(api::auth::logout))
        .route(
            "/api/requetes",
            get(api::requetes::list_requetes).post(api::requetes::create_requete),
        )
        .route("/api/requetes/:id", get(api::requetes::get_requete))
        .route("/api/requetes/:id/statut", patch(api::requetes::update_statut))
        .route("/api/requetes/:id/notes", post(api::requetes::create_note))
        .route("/api/requetes/:id/entite", patch(api::requetes::reroute))
        .route("/api/users", get(api::users::list_users))
        .route(
            "/api/users/:id",
            get(api::users::get_user)
                .patch(api::users::update_user)
                .delete(api::users::deactivate_user),
        )
        .route(
            "/api/entites",
            get(api::entites::list_entites).post(api::entites::create_entite),
        )
        .route(
            "/api/entites/:id",
            get(api::entites::get_entite)
                .patch(api::entites::update_entite)
                .delete(api::entites::delete_entite),
        )
        .route("/api/entites/:id/descendants", get(api::entites::list_descendants))
        .route(
            "/api/uploads",
            post(api::uploads::upload_file)
                .layer(DefaultBodyLimit::max(api::uploads::UPLOAD_BODY_CAP)),
        )
        .route(
            "/api/uploads/:id",
            get(api::uploads::download_file).delete(api::uploads::delete_file),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::auth_middleware,
        ));

    // Public routes (no authentication)
    let public = Router::new()
        .route("/api/auth/login", get(api::auth::login))
        .route("/api/auth/callback", get(api::auth::callback))
        .route("/api/build_info", get(api::get_build_info))
        .merge(api::health_routes());

    // Combine routers
    Router::new()
        .merge(protected)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        // Enable CORS for local access
        .layer(CorsLayer::permissive())
        .with_state(state)
}
