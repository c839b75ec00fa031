//! Upload janitor
//!
//! Periodic maintenance of the uploads area: removes files that were
//! uploaded but never attached to a note within their TTL, rescans files
//! stored unscanned while clamd was down, and purges expired sessions.

use crate::services::clamd::{ClamdClient, ClamdError, ScanVerdict};
use crate::services::session::purge_expired_sessions;
use chrono::{Duration as ChronoDuration, Utc};
use sirena_common::db::settings::get_setting_i64;
use sirena_common::Result;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const RESCAN_BATCH: i64 = 50;

/// Janitor configuration loaded from the settings table
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub sweep_interval_secs: u64,
    pub orphan_ttl_secs: i64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 3600,
            orphan_ttl_secs: 86400,
        }
    }
}

impl JanitorConfig {
    /// Load configuration from database settings, with fallback to defaults
    pub async fn from_database(pool: &SqlitePool) -> Self {
        let defaults = Self::default();

        let sweep_interval_secs = get_setting_i64(
            pool,
            "orphan_sweep_interval_seconds",
            defaults.sweep_interval_secs as i64,
        )
        .await
        .unwrap_or(defaults.sweep_interval_secs as i64)
        .max(1) as u64;

        let orphan_ttl_secs = get_setting_i64(
            pool,
            "upload_orphan_ttl_seconds",
            defaults.orphan_ttl_secs,
        )
        .await
        .unwrap_or(defaults.orphan_ttl_secs)
        .max(0);

        Self {
            sweep_interval_secs,
            orphan_ttl_secs,
        }
    }
}

/// Background maintenance task for uploads and sessions
pub struct UploadJanitor {
    config: JanitorConfig,
    db: SqlitePool,
    clamd: ClamdClient,
    uploads_dir: PathBuf,
}

impl UploadJanitor {
    pub fn new(
        config: JanitorConfig,
        db: SqlitePool,
        clamd: ClamdClient,
        uploads_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            db,
            clamd,
            uploads_dir,
        }
    }

    /// Run the janitor (spawns background task)
    pub fn run(self: Arc<Self>) {
        info!(
            "Starting upload janitor (interval: {}s, orphan TTL: {}s)",
            self.config.sweep_interval_secs, self.config.orphan_ttl_secs
        );

        tokio::spawn(async move {
            let mut timer = interval(Duration::from_secs(self.config.sweep_interval_secs));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                timer.tick().await;

                if let Err(e) = self.sweep_orphans().await {
                    error!("Janitor: orphan sweep failed: {}", e);
                }
                if let Err(e) = self.rescan_pending().await {
                    error!("Janitor: pending rescan failed: {}", e);
                }
                match purge_expired_sessions(&self.db).await {
                    Ok(0) => {}
                    Ok(purged) => debug!("Janitor: purged {} expired sessions", purged),
                    Err(e) => error!("Janitor: session purge failed: {}", e),
                }
            }
        });
    }

    /// Delete unattached uploads older than the orphan TTL
    pub async fn sweep_orphans(&self) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.orphan_ttl_secs);

        let orphans = sqlx::query_as::<_, (String, String)>(
            "SELECT id, path FROM uploaded_files WHERE note_id IS NULL AND created_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;

        let mut removed = 0u64;
        for (id, path) in orphans {
            let full_path = self.uploads_dir.join(&path);
            match tokio::fs::remove_file(&full_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Janitor: could not remove {}: {}", full_path.display(), e);
                    continue;
                }
            }

            sqlx::query("DELETE FROM uploaded_files WHERE id = ?")
                .bind(&id)
                .execute(&self.db)
                .await?;
            removed += 1;
        }

        if removed > 0 {
            info!("Janitor: removed {} orphaned uploads", removed);
        }
        Ok(removed)
    }

    /// Rescan files stored with scan status PENDING while clamd was down
    pub async fn rescan_pending(&self) -> Result<u64> {
        if !self.clamd.enabled() {
            return Ok(0);
        }

        let pending = sqlx::query_as::<_, (String, String)>(
            "SELECT id, path FROM uploaded_files WHERE scan_status = 'PENDING' ORDER BY created_at LIMIT ?",
        )
        .bind(RESCAN_BATCH)
        .fetch_all(&self.db)
        .await?;

        let mut rescanned = 0u64;
        for (id, path) in pending {
            let full_path = self.uploads_dir.join(&path);
            let data = match tokio::fs::read(&full_path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        "Janitor: cannot read {} for rescan ({}), marking ERROR",
                        full_path.display(),
                        e
                    );
                    self.set_scan_status(&id, "ERROR").await?;
                    continue;
                }
            };

            match self.clamd.scan(&data).await {
                Ok(ScanVerdict::Clean) => {
                    self.set_scan_status(&id, "CLEAN").await?;
                    rescanned += 1;
                }
                Ok(ScanVerdict::Infected(signature)) => {
                    warn!("Janitor: upload {} infected ({}), quarantining", id, signature);
                    // Remove the bytes, keep the row with the verdict
                    if let Err(e) = tokio::fs::remove_file(&full_path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!("Janitor: could not remove {}: {}", full_path.display(), e);
                        }
                    }
                    self.set_scan_status(&id, "INFECTED").await?;
                    rescanned += 1;
                }
                Err(ClamdError::Unreachable(reason)) => {
                    // Daemon still down, retry on a later sweep
                    debug!("Janitor: clamd still unreachable ({}), keeping PENDING", reason);
                    break;
                }
                Err(e) => {
                    warn!("Janitor: scan failed for {}: {}", id, e);
                }
            }
        }

        if rescanned > 0 {
            info!("Janitor: rescanned {} pending uploads", rescanned);
        }
        Ok(rescanned)
    }

    async fn set_scan_status(&self, id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE uploaded_files SET scan_status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sirena_common::config::ClamdSettings;
    use sirena_common::db::init_database;
    use tempfile::TempDir;

    fn disabled_clamd() -> ClamdClient {
        ClamdClient::new(ClamdSettings {
            host: "127.0.0.1".to_string(),
            port: 3310,
            disabled: true,
        })
    }

    async fn setup() -> (TempDir, SqlitePool, PathBuf) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("sirena.db")).await.unwrap();
        let uploads_dir = dir.path().join("uploads");
        tokio::fs::create_dir_all(&uploads_dir).await.unwrap();

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, sub, email, role, active, created_at, updated_at)
             VALUES ('u1', 'sub-1', 'agent@example.fr', 'WRITER', 1, ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        (dir, pool, uploads_dir)
    }

    async fn insert_upload(
        pool: &SqlitePool,
        uploads_dir: &PathBuf,
        id: &str,
        note_id: Option<&str>,
        age_secs: i64,
    ) {
        let created_at = Utc::now() - ChronoDuration::seconds(age_secs);
        tokio::fs::write(uploads_dir.join(id), b"content").await.unwrap();

        sqlx::query(
            "INSERT INTO uploaded_files
                 (id, note_id, file_name, content_type, size_bytes, path, sha256, scan_status, uploaded_by, created_at)
             VALUES (?, ?, 'doc.pdf', 'application/pdf', 7, ?, 'x', 'CLEAN', 'u1', ?)",
        )
        .bind(id)
        .bind(note_id)
        .bind(id)
        .bind(created_at)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_orphans() {
        let (_dir, pool, uploads_dir) = setup().await;

        insert_upload(&pool, &uploads_dir, "old-orphan", None, 100_000).await;
        insert_upload(&pool, &uploads_dir, "fresh-orphan", None, 10).await;

        let janitor = UploadJanitor::new(
            JanitorConfig::default(),
            pool.clone(),
            disabled_clamd(),
            uploads_dir.clone(),
        );

        let removed = janitor.sweep_orphans().await.unwrap();
        assert_eq!(removed, 1);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM uploaded_files")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 1);

        assert!(!uploads_dir.join("old-orphan").exists());
        assert!(uploads_dir.join("fresh-orphan").exists());
    }

    #[tokio::test]
    async fn test_sweep_keeps_attached_files() {
        let (_dir, pool, uploads_dir) = setup().await;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO requetes (id, numero, reception_date, created_at, updated_at)
             VALUES ('r1', 1, ?, ?, ?)",
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO requete_entites (id, requete_id, entite_id, created_at, updated_at)
             VALUES ('re1', 'r1', NULL, ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO requete_notes (id, requete_entite_id, author_id, content, created_at)
             VALUES ('n1', 're1', 'u1', 'voir pièce jointe', ?)",
        )
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        insert_upload(&pool, &uploads_dir, "attached", Some("n1"), 100_000).await;

        let janitor = UploadJanitor::new(
            JanitorConfig::default(),
            pool.clone(),
            disabled_clamd(),
            uploads_dir.clone(),
        );

        let removed = janitor.sweep_orphans().await.unwrap();
        assert_eq!(removed, 0);
        assert!(uploads_dir.join("attached").exists());
    }

    #[tokio::test]
    async fn test_sweep_tolerates_missing_disk_file() {
        let (_dir, pool, uploads_dir) = setup().await;

        insert_upload(&pool, &uploads_dir, "gone", None, 100_000).await;
        tokio::fs::remove_file(uploads_dir.join("gone")).await.unwrap();

        let janitor = UploadJanitor::new(
            JanitorConfig::default(),
            pool.clone(),
            disabled_clamd(),
            uploads_dir,
        );

        let removed = janitor.sweep_orphans().await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_rescan_skipped_when_clamd_disabled() {
        let (_dir, pool, uploads_dir) = setup().await;

        let janitor = UploadJanitor::new(
            JanitorConfig::default(),
            pool,
            disabled_clamd(),
            uploads_dir,
        );

        assert_eq!(janitor.rescan_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_config_from_database_defaults() {
        let (_dir, pool, _uploads_dir) = setup().await;

        let config = JanitorConfig::from_database(&pool).await;
        assert_eq!(config.sweep_interval_secs, 3600);
        assert_eq!(config.orphan_ttl_secs, 86400);
    }
}
