//! Typed access to the settings table

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Read a setting value, `None` when missing or NULL
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    Ok(value.flatten())
}

/// Read an integer setting, falling back to `default` when the row is
/// missing or does not parse
pub async fn get_setting_i64(pool: &SqlitePool, key: &str, default: i64) -> Result<i64> {
    match get_setting(pool, key).await? {
        Some(value) => match value.parse::<i64>() {
            Ok(parsed) => Ok(parsed),
            Err(_) => {
                warn!("Setting '{}' has non-integer value '{}', using default {}", key, value, default);
                Ok(default)
            }
        },
        None => Ok(default),
    }
}

/// Write a setting value, creating the row if needed
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}

/// Load the session signing secret, generating one on first use
///
/// The secret signs session cookies. It is created once per database and
/// never logged.
pub async fn load_session_secret(pool: &SqlitePool) -> Result<String> {
    match get_setting(pool, "session_signing_secret").await? {
        Some(secret) if !secret.is_empty() => Ok(secret),
        _ => initialize_session_secret(pool).await,
    }
}

/// Generate and store a fresh session signing secret
///
/// All existing session cookies become invalid when this runs.
pub async fn initialize_session_secret(pool: &SqlitePool) -> Result<String> {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();

    sqlx::query(
        "INSERT OR REPLACE INTO settings (key, value) VALUES ('session_signing_secret', ?)",
    )
    .bind(&secret)
    .execute(pool)
    .await?;

    info!("Generated new session signing secret");
    Ok(secret)
}
