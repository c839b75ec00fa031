//! Session management
//!
//! A login creates one row in the sessions table and hands the browser a
//! signed token carrying the row id. The database row is the source of
//! truth: deleting it revokes the session no matter what the cookie says.
//! The same signing secret also protects the short-lived login-state token
//! used across the OIDC redirect.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sirena_common::db::models::Session;
use sirena_common::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

/// Claims carried by the session cookie
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User id
    pub sub: String,
    /// Session row id
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims carried by the login-state cookie during the OIDC round trip
#[derive(Debug, Serialize, Deserialize)]
pub struct StateClaims {
    pub state: String,
    pub nonce: String,
    pub exp: i64,
}

const STATE_TOKEN_TTL_SECONDS: i64 = 600;

/// Sign a session token for the given session row
pub fn issue_session_token(
    secret: &str,
    user_id: &str,
    session_id: &str,
    ttl_seconds: i64,
) -> std::result::Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = SessionClaims {
        sub: user_id.to_string(),
        jti: session_id.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(ttl_seconds)).timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Verify a session token signature and expiry, returning its claims
pub fn verify_session_token(secret: &str, token: &str) -> Option<SessionClaims> {
    decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .ok()
    .map(|data| data.claims)
}

/// Sign a login-state token binding state and nonce for ten minutes
pub fn issue_state_token(
    secret: &str,
    state: &str,
    nonce: &str,
) -> std::result::Result<String, jsonwebtoken::errors::Error> {
    let claims = StateClaims {
        state: state.to_string(),
        nonce: nonce.to_string(),
        exp: (Utc::now() + Duration::seconds(STATE_TOKEN_TTL_SECONDS)).timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Verify a login-state token, returning its claims
pub fn verify_state_token(secret: &str, token: &str) -> Option<StateClaims> {
    decode::<StateClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .ok()
    .map(|data| data.claims)
}

/// Insert a session row for a fresh login
pub async fn create_session(
    pool: &SqlitePool,
    user_id: &str,
    id_token: Option<&str>,
    ttl_seconds: i64,
) -> Result<Session> {
    let now = Utc::now();
    let session = Session {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        id_token: id_token.map(|t| t.to_string()),
        created_at: now,
        expires_at: now + Duration::seconds(ttl_seconds),
    };

    sqlx::query(
        "INSERT INTO sessions (id, user_id, id_token, created_at, expires_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&session.id)
    .bind(&session.user_id)
    .bind(&session.id_token)
    .bind(session.created_at)
    .bind(session.expires_at)
    .execute(pool)
    .await?;

    Ok(session)
}

pub async fn load_session(pool: &SqlitePool, session_id: &str) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
        .bind(session_id)
        .fetch_optional(pool)
        .await?;

    Ok(session)
}

pub async fn delete_session(pool: &SqlitePool, session_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(session_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Revoke every session of a user (deactivation, role change)
pub async fn delete_user_sessions(pool: &SqlitePool, user_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Delete sessions past their expiry
pub async fn purge_expired_sessions(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sirena_common::db::init_database;
    use tempfile::TempDir;

    const SECRET: &str = "test-secret-test-secret-test-secret-test-secret!";

    #[test]
    fn test_session_token_round_trip() {
        let token = issue_session_token(SECRET, "user-1", "session-1", 3600).unwrap();
        let claims = verify_session_token(SECRET, &token).unwrap();

        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.jti, "session-1");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_session_token_wrong_secret_rejected() {
        let token = issue_session_token(SECRET, "user-1", "session-1", 3600).unwrap();
        assert!(verify_session_token("another-secret-another-secret!!", &token).is_none());
    }

    #[test]
    fn test_session_token_garbage_rejected() {
        assert!(verify_session_token(SECRET, "not.a.token").is_none());
        assert!(verify_session_token(SECRET, "").is_none());
    }

    #[test]
    fn test_state_token_round_trip() {
        let token = issue_state_token(SECRET, "state-abc", "nonce-xyz").unwrap();
        let claims = verify_state_token(SECRET, &token).unwrap();

        assert_eq!(claims.state, "state-abc");
        assert_eq!(claims.nonce, "nonce-xyz");
    }

    async fn setup() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("sirena.db")).await.unwrap();

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, sub, email, role, active, created_at, updated_at)
             VALUES ('u1', 'sub-1', 'agent@example.fr', 'READER', 1, ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        (dir, pool)
    }

    #[tokio::test]
    async fn test_create_load_delete_session() {
        let (_dir, pool) = setup().await;

        let session = create_session(&pool, "u1", Some("id-token"), 3600).await.unwrap();

        let loaded = load_session(&pool, &session.id).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "u1");
        assert_eq!(loaded.id_token.as_deref(), Some("id-token"));
        assert!(loaded.expires_at > Utc::now());

        delete_session(&pool, &session.id).await.unwrap();
        assert!(load_session(&pool, &session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_user_sessions() {
        let (_dir, pool) = setup().await;

        create_session(&pool, "u1", None, 3600).await.unwrap();
        create_session(&pool, "u1", None, 3600).await.unwrap();

        let deleted = delete_user_sessions(&pool, "u1").await.unwrap();
        assert_eq!(deleted, 2);
    }

    #[tokio::test]
    async fn test_purge_expired_sessions() {
        let (_dir, pool) = setup().await;

        // One expired (negative TTL), one live
        let expired = create_session(&pool, "u1", None, -60).await.unwrap();
        let live = create_session(&pool, "u1", None, 3600).await.unwrap();

        let purged = purge_expired_sessions(&pool).await.unwrap();
        assert_eq!(purged, 1);

        assert!(load_session(&pool, &expired.id).await.unwrap().is_none());
        assert!(load_session(&pool, &live.id).await.unwrap().is_some());
    }
}
