//! Login, callback, logout and profile endpoints
//!
//! The login flow is the OIDC authorization code flow. State and nonce are
//! generated per attempt and carried across the redirect in a signed,
//! short-lived cookie, so the callback can verify both without server-side
//! storage.

use crate::api::entites::EntiteRef;
use crate::api::AuthContext;
use crate::error::{ApiError, ApiResult};
use crate::services::cookies;
use crate::services::oidc::{random_token, IdTokenClaims, OidcError};
use crate::services::session::{
    create_session, delete_session, issue_session_token, issue_state_token, load_session,
    verify_state_token,
};
use crate::AppState;
use axum::{
    extract::{Extension, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sirena_common::db::models::User;
use sirena_common::db::settings::get_setting_i64;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

const STATE_TOKEN_LEN: usize = 32;

/// GET /api/auth/login
///
/// Starts a login attempt: 302 to the provider's authorization endpoint
/// with a fresh state and nonce, both pinned in the state cookie.
pub async fn login(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let login_state = random_token(STATE_TOKEN_LEN);
    let nonce = random_token(STATE_TOKEN_LEN);

    let url = state
        .oidc
        .authorization_url(&login_state, &nonce)
        .map_err(|e| ApiError::Internal(format!("cannot build authorization URL: {}", e)))?;

    let state_token = issue_state_token(&state.session_secret, &login_state, &nonce)
        .map_err(|e| ApiError::Internal(format!("cannot sign state token: {}", e)))?;

    Ok((
        StatusCode::FOUND,
        [
            (header::LOCATION, url),
            (header::SET_COOKIE, cookies::state_cookie(&state_token)),
        ],
    ))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// GET /api/auth/callback
///
/// Completes the login: verifies state, exchanges the code, validates the
/// id_token, upserts the user, and opens a session.
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    if let Some(error) = &query.error {
        warn!(
            error = %error,
            description = query.error_description.as_deref().unwrap_or(""),
            "Provider refused the login"
        );
        return Err(ApiError::Unauthorized(format!(
            "provider returned error: {}",
            error
        )));
    }

    let code = query
        .code
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing code parameter".to_string()))?;
    let returned_state = query
        .state
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing state parameter".to_string()))?;

    let state_token = cookies::cookie_value(&headers, cookies::STATE_COOKIE)
        .ok_or_else(|| ApiError::BadRequest("login state missing or expired".to_string()))?;
    let state_claims = verify_state_token(&state.session_secret, &state_token)
        .ok_or_else(|| ApiError::BadRequest("login state missing or expired".to_string()))?;

    if state_claims.state != returned_state {
        warn!("State mismatch on OIDC callback");
        return Err(ApiError::BadRequest("state mismatch".to_string()));
    }

    let tokens = state.oidc.exchange_code(code).await.map_err(|e| match e {
        OidcError::ProviderError(status, body) => {
            ApiError::BadGateway(format!("token exchange failed ({}): {}", status, body))
        }
        other => ApiError::BadGateway(format!("token exchange failed: {}", other)),
    })?;

    let claims = state
        .oidc
        .validate_id_token(&tokens.id_token, &state_claims.nonce)
        .await
        .map_err(|e| ApiError::Unauthorized(format!("id_token rejected: {}", e)))?;

    let user = upsert_user(&state.db, &claims).await?;

    if !user.active {
        warn!(user_id = %user.id, "Login attempt on deactivated account");
        return Err(ApiError::Forbidden("account deactivated".to_string()));
    }

    let ttl = get_setting_i64(&state.db, "session_ttl_seconds", 86400).await?;
    let session = create_session(&state.db, &user.id, Some(&tokens.id_token), ttl).await?;
    let token = issue_session_token(&state.session_secret, &user.id, &session.id, ttl)
        .map_err(|e| ApiError::Internal(format!("cannot sign session token: {}", e)))?;

    info!(user_id = %user.id, role = %user.role, "Login completed");

    Ok((
        StatusCode::FOUND,
        [
            (
                header::LOCATION,
                state.oidc.settings().frontend_url.clone(),
            ),
            (header::SET_COOKIE, cookies::session_cookie(&token, ttl)),
            (header::SET_COOKIE, cookies::clear_state_cookie()),
        ],
    ))
}

/// Create or refresh the user row for a validated id_token
///
/// Matching is by `sub` first. An account pre-created by an administrator
/// (email known, no sub yet) is adopted on first login. Anyone else gets a
/// fresh PENDING account.
async fn upsert_user(db: &SqlitePool, claims: &IdTokenClaims) -> ApiResult<User> {
    let email = claims
        .email
        .as_deref()
        .ok_or_else(|| ApiError::BadGateway("provider did not supply an email".to_string()))?;
    let prenom = claims.given_name.as_deref();
    let nom = claims
        .usual_name
        .as_deref()
        .or(claims.family_name.as_deref());
    let now = Utc::now();

    let by_sub = sqlx::query_as::<_, User>("SELECT * FROM users WHERE sub = ?")
        .bind(&claims.sub)
        .fetch_optional(db)
        .await?;

    if let Some(user) = by_sub {
        sqlx::query("UPDATE users SET email = ?, prenom = ?, nom = ?, updated_at = ? WHERE id = ?")
            .bind(email)
            .bind(prenom)
            .bind(nom)
            .bind(now)
            .bind(&user.id)
            .execute(db)
            .await?;

        return load_user(db, &user.id).await;
    }

    let by_email = sqlx::query_as::<_, User>("SELECT * FROM users WHERE lower(email) = lower(?)")
        .bind(email)
        .fetch_optional(db)
        .await?;

    if let Some(user) = by_email {
        info!(user_id = %user.id, "Adopting pre-created account on first login");
        sqlx::query("UPDATE users SET sub = ?, prenom = ?, nom = ?, updated_at = ? WHERE id = ?")
            .bind(&claims.sub)
            .bind(prenom)
            .bind(nom)
            .bind(now)
            .bind(&user.id)
            .execute(db)
            .await?;

        return load_user(db, &user.id).await;
    }

    let id = Uuid::new_v4().to_string();
    info!(user_id = %id, "Creating PENDING account on first login");
    sqlx::query(
        "INSERT INTO users (id, sub, email, prenom, nom, role, active, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, 'PENDING', 1, ?, ?)",
    )
    .bind(&id)
    .bind(&claims.sub)
    .bind(email)
    .bind(prenom)
    .bind(nom)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    load_user(db, &id).await
}

async fn load_user(db: &SqlitePool, id: &str) -> ApiResult<User> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| ApiError::Internal(format!("user {} vanished during upsert", id)))?;

    Ok(user)
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub logout_url: Option<String>,
}

/// POST /api/auth/logout
///
/// Revokes the session and hands the frontend the provider logout URL.
pub async fn logout(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<impl IntoResponse> {
    let session = load_session(&state.db, &ctx.session_id).await?;
    let id_token = session.and_then(|s| s.id_token);

    delete_session(&state.db, &ctx.session_id).await?;
    info!(user_id = %ctx.user_id, "Logout");

    let logout_url = state.oidc.end_session_url(id_token.as_deref());

    Ok((
        [(header::SET_COOKIE, cookies::clear_session_cookie())],
        Json(LogoutResponse { logout_url }),
    ))
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub id: String,
    pub email: String,
    pub prenom: Option<String>,
    pub nom: Option<String>,
    pub role: String,
    pub entite: Option<EntiteRef>,
}

/// GET /api/profile
///
/// The caller's own account. This is the one endpoint a PENDING user can
/// read, so the frontend can show the "awaiting activation" screen.
pub async fn get_profile(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<Json<ProfileResponse>> {
    let user = load_user(&state.db, &ctx.user_id).await?;

    let entite = match &user.entite_id {
        Some(entite_id) => {
            let tree = state.entites.tree().await?;
            tree.get(entite_id).map(|e| EntiteRef {
                id: e.id.clone(),
                label: e.label.clone(),
            })
        }
        None => None,
    };

    Ok(Json(ProfileResponse {
        id: user.id,
        email: user.email,
        prenom: user.prenom,
        nom: user.nom,
        role: user.role,
        entite,
    }))
}
