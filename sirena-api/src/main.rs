//! sirena-api - Case management HTTP API
//!
//! Serves the requête, entity, user and upload endpoints behind OIDC
//! session authentication. Shares sirena.db with sirena-importer.

use anyhow::Result;
use sirena_api::services::{ClamdClient, EntiteCache, JanitorConfig, OidcClient, UploadJanitor};
use sirena_api::{build_router, AppState};
use sirena_common::config::{
    load_module_config, ClamdSettings, OidcSettings, RootFolderInitializer, RootFolderResolver,
};
use sirena_common::db::settings::{get_setting_i64, load_session_secret};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Log build identification immediately, before database delays
    info!(
        "Starting SIRENA API (sirena-api) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let resolver = RootFolderResolver::new("api");
    let root_folder = resolver.resolve();

    let initializer = RootFolderInitializer::new(root_folder);
    initializer.ensure_directory_exists()?;

    let db_path = initializer.database_path();
    info!("Database path: {}", db_path.display());

    let pool = match sirena_common::db::init_database(&db_path).await {
        Ok(pool) => {
            info!("✓ Database initialized");
            pool
        }
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return Err(e.into());
        }
    };

    let session_secret = load_session_secret(&pool).await?;
    info!("✓ Session signing secret loaded");

    let cache_ttl = get_setting_i64(&pool, "entites_cache_ttl_seconds", 600)
        .await?
        .max(1) as u64;
    let entites = EntiteCache::new(pool.clone(), Duration::from_secs(cache_ttl));

    let oidc_settings = OidcSettings::from_env()?;
    let oidc = match OidcClient::discover(oidc_settings).await {
        Ok(client) => {
            info!("✓ OIDC provider discovered");
            Arc::new(client)
        }
        Err(e) => {
            error!("OIDC discovery failed: {}", e);
            return Err(e.into());
        }
    };

    let clamd_settings = ClamdSettings::from_env_or_default();
    if clamd_settings.disabled {
        warn!("Virus scanning is DISABLED; uploads will be stored unscanned");
    } else {
        info!(
            "clamd scanner at {}:{}",
            clamd_settings.host, clamd_settings.port
        );
    }
    let clamd = ClamdClient::new(clamd_settings);

    let uploads_dir = initializer.uploads_path();
    let state = AppState::new(
        pool.clone(),
        entites,
        oidc,
        clamd.clone(),
        uploads_dir.clone(),
        session_secret,
    );

    let janitor_config = JanitorConfig::from_database(&pool).await;
    Arc::new(UploadJanitor::new(
        janitor_config,
        pool.clone(),
        clamd,
        uploads_dir,
    ))
    .run();

    let module_config = load_module_config(&pool, "api").await?;
    let bind_address = format!("{}:{}", module_config.host, module_config.port);

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("sirena-api listening on http://{}", bind_address);
    info!("Health check: http://{}/health", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
