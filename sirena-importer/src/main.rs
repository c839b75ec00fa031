//! sirena-importer - Demat Social import service
//!
//! Pulls dossiers from the Demat Social GraphQL API into sirena.db, either
//! once (`run`) or on a schedule with a status API (`serve`).

use anyhow::Result;
use clap::{Parser, Subcommand};
use sirena_common::config::{
    load_module_config, DematSocialSettings, RootFolderInitializer, RootFolderResolver,
};
use sirena_importer::api::{self, AppState};
use sirena_importer::{import, DematSocialClient, ImportScheduler};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Command-line arguments for sirena-importer
#[derive(Parser, Debug)]
#[command(name = "sirena-importer")]
#[command(about = "Demat Social import service for SIRENA")]
#[command(version)]
struct Args {
    /// Root folder containing sirena.db
    #[arg(short, long, env = "SIRENA_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single import and exit
    Run,
    /// Run the import scheduler with the status API
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    info!(
        "Starting SIRENA importer (sirena-importer) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let resolver = RootFolderResolver::new("importer").with_cli_arg(args.root_folder.clone());
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

    let interrupted = import::close_stale_runs(&pool).await?;
    if interrupted > 0 {
        warn!(
            "Closed {} import run(s) a previous process left unfinished",
            interrupted
        );
    }

    let demat_settings = DematSocialSettings::from_env()?;
    info!(
        "Demat Social démarche {} at {}",
        demat_settings.demarche_number, demat_settings.api_url
    );
    let client = DematSocialClient::new(demat_settings)?;

    match args.command {
        Command::Run => run_once(&pool, &client).await,
        Command::Serve => serve(pool, client).await,
    }
}

/// One import, foreground. Exits non-zero when the run did not succeed so
/// cron and systemd timers see the failure.
async fn run_once(pool: &SqlitePool, client: &DematSocialClient) -> Result<()> {
    let run = import::import_requetes(pool, client).await?;

    if run.status != "SUCCEEDED" {
        error!(
            "Import run {} failed: {}",
            run.id,
            run.error.as_deref().unwrap_or("unknown error")
        );
        std::process::exit(1);
    }

    Ok(())
}

async fn serve(pool: SqlitePool, client: DematSocialClient) -> Result<()> {
    Arc::new(ImportScheduler::from_database(pool.clone(), client).await).run();

    let module_config = load_module_config(&pool, "importer").await?;
    let bind_address = format!("{}:{}", module_config.host, module_config.port);

    let app = api::build_router(AppState { db: pool });

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("sirena-importer listening on http://{}", bind_address);
    info!("Run history: http://{}/runs", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
