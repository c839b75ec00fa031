//! HTTP API handlers for sirena-api

pub mod auth;
pub mod entites;
pub mod health;
pub mod requetes;
pub mod uploads;
pub mod users;

pub use health::health_routes;

use crate::error::{ApiError, ApiResult};
use crate::services::cookies::{cookie_value, SESSION_COOKIE};
use crate::services::session::{delete_session, load_session, verify_session_token};
use crate::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
    Json,
};
use chrono::Utc;
use serde::Serialize;
use sirena_common::db::models::User;
use sirena_common::Role;
use tracing::debug;

/// Authenticated request context, inserted by the session middleware
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub session_id: String,
    pub email: String,
    pub role: Role,
    pub entite_id: Option<String>,
}

/// Session middleware
///
/// Resolves the session cookie to a user. The token only locates the
/// session row; the row decides. A token whose row is gone or expired is
/// rejected no matter how valid its signature still is.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = cookie_value(request.headers(), SESSION_COOKIE)
        .ok_or_else(|| ApiError::Unauthorized("missing session cookie".to_string()))?;

    let claims = verify_session_token(&state.session_secret, &token)
        .ok_or_else(|| ApiError::Unauthorized("invalid session token".to_string()))?;

    let session = load_session(&state.db, &claims.jti)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("session revoked".to_string()))?;

    if session.expires_at < Utc::now() {
        debug!(session_id = %session.id, "Deleting expired session");
        delete_session(&state.db, &session.id).await?;
        return Err(ApiError::Unauthorized("session expired".to_string()));
    }

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(&session.user_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("unknown user".to_string()))?;

    if !user.active {
        return Err(ApiError::Forbidden("account deactivated".to_string()));
    }

    let role = Role::parse(&user.role)
        .map_err(|e| ApiError::Internal(format!("corrupt role for user {}: {}", user.id, e)))?;

    request.extensions_mut().insert(AuthContext {
        user_id: user.id,
        session_id: session.id,
        email: user.email,
        role,
        entite_id: user.entite_id,
    });

    Ok(next.run(request).await)
}

/// Reject callers below the given role with 403
pub fn require_role(ctx: &AuthContext, min: Role) -> ApiResult<()> {
    if ctx.role.at_least(min) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "requires role {} or above",
            min.as_str()
        )))
    }
}

/// Entity ids visible to the caller
///
/// `None` means unrestricted (national roles). A scoped user without an
/// assigned entity sees an empty scope.
pub async fn visible_entites(
    state: &AppState,
    ctx: &AuthContext,
) -> ApiResult<Option<Vec<String>>> {
    if ctx.role.is_national() {
        return Ok(None);
    }

    match &ctx.entite_id {
        Some(entite_id) => {
            let tree = state.entites.tree().await?;
            Ok(Some(tree.descendants(entite_id)))
        }
        None => Ok(Some(Vec::new())),
    }
}

/// Build information response
#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub version: String,
    pub git_hash: String,
    pub build_timestamp: String,
    pub build_profile: String,
}

/// GET /api/build_info
///
/// Returns build identification information for UI display
pub async fn get_build_info() -> Json<BuildInfo> {
    Json(BuildInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("GIT_HASH").to_string(),
        build_timestamp: env!("BUILD_TIMESTAMP").to_string(),
        build_profile: env!("BUILD_PROFILE").to_string(),
    })
}
