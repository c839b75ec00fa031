//! Scheduled import driver
//!
//! Drives `import_requetes` on a fixed interval. A tick that lands while a
//! run is still active is skipped, not queued.

use crate::dematsocial::DematSocialClient;
use crate::import::import_requetes;
use sirena_common::db::settings::get_setting_i64;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{error, info, warn};

pub struct ImportScheduler {
    db: SqlitePool,
    client: DematSocialClient,
    interval_secs: u64,
    running: Mutex<()>,
}

impl ImportScheduler {
    /// Build a scheduler with the interval from the settings table
    pub async fn from_database(db: SqlitePool, client: DematSocialClient) -> Self {
        let interval_secs = get_setting_i64(&db, "import_interval_seconds", 3600)
            .await
            .unwrap_or(3600)
            .max(1) as u64;

        Self {
            db,
            client,
            interval_secs,
            running: Mutex::new(()),
        }
    }

    /// Run the scheduler (spawns background task)
    ///
    /// The first tick fires immediately, so serve mode starts with a run.
    pub fn run(self: Arc<Self>) {
        info!("Starting import scheduler (interval: {}s)", self.interval_secs);

        tokio::spawn(async move {
            let mut timer = interval(Duration::from_secs(self.interval_secs));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                timer.tick().await;
                self.tick().await;
            }
        });
    }

    /// One tick: run an import unless one is already active
    pub async fn tick(&self) {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous import still running, skipping this tick");
            return;
        };

        match import_requetes(&self.db, &self.client).await {
            Ok(run) if run.status == "SUCCEEDED" => {}
            Ok(run) => warn!(run_id = %run.id, "Import run closed as {}", run.status),
            Err(e) => error!("Import run failed: {}", e),
        }
    }
}
