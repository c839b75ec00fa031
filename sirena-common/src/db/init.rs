//! Database initialization
//!
//! Creates the schema on first run and keeps it current on every start.
//! All services call `init_database` at startup; every statement here is
//! idempotent.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL mode allows concurrent readers with one writer, which matters
    // when the API and the importer share the database file
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    // Schema creation (idempotent - safe to call multiple times)
    create_schema_version_table(&pool).await?;
    create_settings_table(&pool).await?;
    create_module_config_table(&pool).await?;
    create_entites_table(&pool).await?;
    create_users_table(&pool).await?;
    create_sessions_table(&pool).await?;
    create_requetes_table(&pool).await?;
    create_requete_entites_table(&pool).await?;
    create_requete_notes_table(&pool).await?;
    create_uploaded_files_table(&pool).await?;
    create_import_runs_table(&pool).await?;

    // Manual migrations for transformations CREATE TABLE IF NOT EXISTS
    // cannot express
    crate::db::migrations::run_migrations(&pool).await?;

    // Initialize default settings
    init_default_settings(&pool).await?;

    Ok(pool)
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores application configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_module_config_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS module_config (
            module_name TEXT PRIMARY KEY CHECK (module_name IN ('api', 'importer')),
            host TEXT NOT NULL,
            port INTEGER NOT NULL CHECK (port > 0 AND port <= 65535),
            enabled INTEGER NOT NULL DEFAULT 1,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Initialize default module configurations
    let defaults = vec![("api", "127.0.0.1", 8460), ("importer", "127.0.0.1", 8461)];

    for (module_name, host, port) in defaults {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO module_config (module_name, host, port, enabled)
            VALUES (?, ?, ?, 1)
            "#,
        )
        .bind(module_name)
        .bind(host)
        .bind(port)
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Create the entites table
///
/// Stores the administrative entity forest. `parent_id` links a child to
/// its parent; `code` is the routing key used by the Demat Social import.
pub async fn create_entites_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entites (
            id TEXT PRIMARY KEY,
            nom TEXT NOT NULL,
            label TEXT NOT NULL,
            categorie TEXT NOT NULL CHECK (categorie IN ('ARS', 'DD', 'CD', 'ORGANISME', 'AUTRE')),
            code TEXT,
            email TEXT,
            parent_id TEXT REFERENCES entites(id),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entites_parent ON entites(parent_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_entites_code ON entites(code)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the users table
///
/// Accounts are created on first OIDC login with role PENDING and no
/// entity; an administrator assigns both afterwards.
pub async fn create_users_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            sub TEXT UNIQUE,
            email TEXT NOT NULL UNIQUE,
            prenom TEXT,
            nom TEXT,
            role TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (role IN ('PENDING', 'READER', 'WRITER', 'ENTITY_ADMIN', 'NATIONAL_STEERING', 'SUPER_ADMIN')),
            entite_id TEXT REFERENCES entites(id),
            active INTEGER NOT NULL DEFAULT 1,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_users_email ON users(email)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_users_entite ON users(entite_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the sessions table
///
/// One row per login; the session cookie carries the row id. Deleting the
/// row revokes the session immediately.
pub async fn create_sessions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            id_token TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            expires_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the requetes table
///
/// `numero` is the human-facing sequential number; `dematsocial_id` is the
/// dossier number in Demat Social for imported requêtes (NULL for manual
/// creations).
pub async fn create_requetes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS requetes (
            id TEXT PRIMARY KEY,
            numero INTEGER NOT NULL UNIQUE,
            dematsocial_id INTEGER UNIQUE,
            reception_date TIMESTAMP NOT NULL,
            reception_type TEXT NOT NULL DEFAULT 'FORMULAIRE'
                CHECK (reception_type IN ('FORMULAIRE', 'EMAIL', 'COURRIER', 'TELEPHONE', 'PLATEFORME')),
            commune TEXT,
            declarant_civilite TEXT,
            declarant_prenom TEXT,
            declarant_nom TEXT,
            declarant_email TEXT,
            declarant_telephone TEXT,
            description TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (numero > 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_requetes_numero ON requetes(numero)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requetes_dematsocial ON requetes(dematsocial_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requetes_reception ON requetes(reception_date)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the requete_entites table
///
/// Routing rows: which entity handles a requête, with the processing
/// statut. Imported dossiers whose routing code matches no entity get a
/// row with entite_id NULL.
pub async fn create_requete_entites_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS requete_entites (
            id TEXT PRIMARY KEY,
            requete_id TEXT NOT NULL REFERENCES requetes(id) ON DELETE CASCADE,
            entite_id TEXT REFERENCES entites(id),
            statut TEXT NOT NULL DEFAULT 'A_QUALIFIER'
                CHECK (statut IN ('A_QUALIFIER', 'EN_COURS', 'FAIT', 'CLOTUREE')),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (requete_id, entite_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requete_entites_requete ON requete_entites(requete_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requete_entites_entite ON requete_entites(entite_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requete_entites_statut ON requete_entites(statut)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the requete_notes table
pub async fn create_requete_notes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS requete_notes (
            id TEXT PRIMARY KEY,
            requete_entite_id TEXT NOT NULL REFERENCES requete_entites(id) ON DELETE CASCADE,
            author_id TEXT NOT NULL REFERENCES users(id),
            content TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requete_notes_routing ON requete_notes(requete_entite_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the uploaded_files table
///
/// Files are uploaded first and attached to a note later; `note_id` stays
/// NULL until attachment. Unattached files past their TTL are swept by the
/// janitor.
pub async fn create_uploaded_files_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uploaded_files (
            id TEXT PRIMARY KEY,
            note_id TEXT REFERENCES requete_notes(id) ON DELETE SET NULL,
            file_name TEXT NOT NULL,
            content_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
            path TEXT NOT NULL UNIQUE,
            sha256 TEXT NOT NULL,
            scan_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (scan_status IN ('PENDING', 'CLEAN', 'INFECTED', 'ERROR')),
            uploaded_by TEXT NOT NULL REFERENCES users(id),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_uploaded_files_note ON uploaded_files(note_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_uploaded_files_uploader ON uploaded_files(uploaded_by)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_uploaded_files_created ON uploaded_files(created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the import_runs table
///
/// One row per Demat Social import run, with counters for reporting.
pub async fn create_import_runs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_runs (
            id TEXT PRIMARY KEY,
            started_at TIMESTAMP NOT NULL,
            ended_at TIMESTAMP,
            status TEXT NOT NULL DEFAULT 'RUNNING'
                CHECK (status IN ('RUNNING', 'SUCCEEDED', 'FAILED')),
            dossiers_seen INTEGER NOT NULL DEFAULT 0,
            created INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            unrouted INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_import_runs_started ON import_runs(started_at)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Initialize or update default settings
///
/// This function ensures all required settings exist with default values.
/// It also handles NULL values by resetting them to defaults.
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Session settings
    ensure_setting(pool, "session_ttl_seconds", "86400").await?; // 24 hours

    // Entity cache settings
    ensure_setting(pool, "entites_cache_ttl_seconds", "600").await?; // 10 minutes

    // Import settings
    ensure_setting(pool, "import_interval_seconds", "3600").await?; // hourly
    ensure_setting(pool, "import_page_size", "100").await?;
    ensure_setting(pool, "last_import_at", "").await?; // Empty = full import

    // Upload settings
    ensure_setting(pool, "upload_max_bytes", "10485760").await?; // 10 MB
    ensure_setting(pool, "upload_orphan_ttl_seconds", "86400").await?; // 24 hours
    ensure_setting(pool, "orphan_sweep_interval_seconds", "3600").await?;

    info!("Default settings initialized");
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting doesn't exist, it will be created with the default.
/// If the setting exists but has a NULL value, it will be reset to the default.
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    // Check if setting exists
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if !exists {
        // Use INSERT OR IGNORE to handle concurrent initialization race conditions
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(default_value)
            .execute(pool)
            .await?;

        info!("Initialized setting '{}' with default value: {}", key, default_value);
        return Ok(());
    }

    // Check if value is NULL
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if value.is_none() {
        sqlx::query("UPDATE settings SET value = ? WHERE key = ?")
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;

        warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_database_creates_schema() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("sirena.db");

        let pool = init_database(&db_path).await.unwrap();

        for table in [
            "settings",
            "module_config",
            "entites",
            "users",
            "sessions",
            "requetes",
            "requete_entites",
            "requete_notes",
            "uploaded_files",
            "import_runs",
        ] {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert!(exists, "table {} missing", table);
        }
    }

    #[tokio::test]
    async fn test_init_database_idempotent() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("sirena.db");

        let pool = init_database(&db_path).await.unwrap();
        drop(pool);
        let pool = init_database(&db_path).await.unwrap();

        let api_port: i64 =
            sqlx::query_scalar("SELECT port FROM module_config WHERE module_name = 'api'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(api_port, 8460);
    }

    #[tokio::test]
    async fn test_default_settings_seeded() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("sirena.db")).await.unwrap();

        let ttl: Option<String> =
            sqlx::query_scalar("SELECT value FROM settings WHERE key = 'session_ttl_seconds'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(ttl.as_deref(), Some("86400"));
    }

    #[tokio::test]
    async fn test_ensure_setting_resets_null() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("sirena.db")).await.unwrap();

        sqlx::query("UPDATE settings SET value = NULL WHERE key = 'import_page_size'")
            .execute(&pool)
            .await
            .unwrap();

        ensure_setting(&pool, "import_page_size", "100").await.unwrap();

        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM settings WHERE key = 'import_page_size'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(value.as_deref(), Some("100"));
    }

    #[tokio::test]
    async fn test_requete_entites_unique_pair() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("sirena.db")).await.unwrap();
        let now = chrono::Utc::now();

        sqlx::query(
            "INSERT INTO entites (id, nom, label, categorie, created_at, updated_at) VALUES ('e1', 'ARS Test', 'ARS-T', 'ARS', ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO requetes (id, numero, reception_date, created_at, updated_at) VALUES ('r1', 1, ?, ?, ?)",
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO requete_entites (id, requete_id, entite_id, created_at, updated_at) VALUES ('re1', 'r1', 'e1', ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        let duplicate = sqlx::query(
            "INSERT INTO requete_entites (id, requete_id, entite_id, created_at, updated_at) VALUES ('re2', 'r1', 'e1', ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await;
        assert!(duplicate.is_err());
    }
}
