//! Database schema migrations
//!
//! Versioned migrations upgrade existing databases in place. Fresh databases
//! get the current schema from `init` and only record the version here.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations** - They must remain stable for users upgrading from older versions
//! 2. **Always add new migrations** - Create a new migration function for each schema change
//! 3. **Test migrations** - Verify they work on databases with old schema
//! 4. **Use ALTER TABLE** - Prefer ALTER TABLE over DROP/CREATE to preserve data

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Get current schema version from database
///
/// Returns 0 if schema_version table doesn't exist or has no rows
async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='schema_version'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

/// Set schema version in database
async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        warn!("This may indicate a downgrade. Proceeding with caution.");
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    // Run migrations sequentially
    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("✓ Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("✓ Migration v2 completed");
    }

    info!("All migrations completed successfully");
    Ok(())
}

/// Migration v1: Add failed counter to import_runs
///
/// **Background:** Early import runs only counted created/updated/skipped
/// rows. Per-dossier failures were logged but not reported, so runs with
/// mapping errors looked clean in the run history. This adds the counter
/// to existing databases.
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v1: Add failed column to import_runs");

    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='import_runs'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        // Table doesn't exist yet - will be created with correct schema
        info!("  import_runs table doesn't exist yet - skipping migration");
        return Ok(());
    }

    let has_column: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('import_runs') WHERE name = 'failed'",
    )
    .fetch_one(pool)
    .await?;

    if has_column > 0 {
        info!("  failed column already exists - skipping");
        return Ok(());
    }

    sqlx::query("ALTER TABLE import_runs ADD COLUMN failed INTEGER NOT NULL DEFAULT 0")
        .execute(pool)
        .await?;

    info!("  ✓ Added failed column to import_runs table");
    Ok(())
}

/// Migration v2: Add commune column to requetes
///
/// **Background:** The reception form gained a commune field after the
/// first release. Imported dossiers carry it as a labelled champ; existing
/// rows keep NULL.
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v2: Add commune column to requetes");

    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='requetes'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        info!("  requetes table doesn't exist yet - skipping migration");
        return Ok(());
    }

    let has_column: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('requetes') WHERE name = 'commune'",
    )
    .fetch_one(pool)
    .await?;

    if has_column > 0 {
        info!("  commune column already exists - skipping");
        return Ok(());
    }

    // Catch duplicate column error for concurrent initialization race conditions
    match sqlx::query("ALTER TABLE requetes ADD COLUMN commune TEXT")
        .execute(pool)
        .await
    {
        Ok(_) => {
            info!("  ✓ Added commune column to requetes table");
            Ok(())
        }
        Err(sqlx::Error::Database(db_err)) if db_err.message().contains("duplicate column") => {
            // Another thread beat us to it - that's fine
            info!("  commune column added by concurrent thread - skipping");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_schema_version_no_table() {
        let pool = setup_test_db().await;
        let version = get_schema_version(&pool).await.unwrap();
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn test_get_schema_version_empty_table() {
        let pool = setup_test_db().await;

        sqlx::query(
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)"
        )
        .execute(&pool)
        .await
        .unwrap();

        let version = get_schema_version(&pool).await.unwrap();
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn test_set_and_get_schema_version() {
        let pool = setup_test_db().await;

        sqlx::query(
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)"
        )
        .execute(&pool)
        .await
        .unwrap();

        set_schema_version(&pool, 1).await.unwrap();
        let version = get_schema_version(&pool).await.unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_migrate_v1_no_table() {
        let pool = setup_test_db().await;

        // Should succeed even if import_runs table doesn't exist
        migrate_v1(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_migrate_v1_adds_column() {
        let pool = setup_test_db().await;

        // Create import_runs table WITHOUT failed column
        sqlx::query(
            r#"
            CREATE TABLE import_runs (
                id TEXT PRIMARY KEY,
                started_at TIMESTAMP NOT NULL,
                status TEXT NOT NULL DEFAULT 'RUNNING'
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        migrate_v1(&pool).await.unwrap();

        let has_column: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('import_runs') WHERE name = 'failed'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(has_column, 1);
    }

    #[tokio::test]
    async fn test_migrate_v1_idempotent() {
        let pool = setup_test_db().await;

        sqlx::query(
            r#"
            CREATE TABLE import_runs (
                id TEXT PRIMARY KEY,
                started_at TIMESTAMP NOT NULL,
                status TEXT NOT NULL DEFAULT 'RUNNING',
                failed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        // Run migration twice - should not fail
        migrate_v1(&pool).await.unwrap();
        migrate_v1(&pool).await.unwrap();

        let column_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('import_runs') WHERE name = 'failed'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(column_count, 1);
    }

    #[tokio::test]
    async fn test_run_migrations_complete_flow() {
        let pool = setup_test_db().await;

        sqlx::query(
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)"
        )
        .execute(&pool)
        .await
        .unwrap();

        // Old-schema tables missing the migrated columns
        sqlx::query(
            r#"
            CREATE TABLE import_runs (
                id TEXT PRIMARY KEY,
                started_at TIMESTAMP NOT NULL,
                status TEXT NOT NULL DEFAULT 'RUNNING'
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE requetes (
                id TEXT PRIMARY KEY,
                numero INTEGER NOT NULL UNIQUE,
                reception_date TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        run_migrations(&pool).await.unwrap();

        let version = get_schema_version(&pool).await.unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);

        let has_failed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('import_runs') WHERE name = 'failed'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(has_failed, 1);

        let has_commune: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('requetes') WHERE name = 'commune'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(has_commune, 1);
    }
}
