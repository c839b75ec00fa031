//! User administration endpoints
//!
//! Visibility follows the entity tree: entity admins manage the users of
//! their subtree plus unassigned PENDING accounts awaiting activation;
//! national roles manage everyone. Nobody touches their own row here, and
//! nobody touches a user ranked above them.

use crate::api::entites::EntiteRef;
use crate::api::{require_role, visible_entites, AuthContext};
use crate::error::{ApiError, ApiResult};
use crate::services::session;
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sirena_common::db::models::User;
use sirena_common::pagination::{calculate_pagination, PAGE_SIZE};
use sirena_common::Role;
use tracing::info;

/// Distinguishes an absent field from an explicit null
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub role: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: String,
    pub email: String,
    pub prenom: Option<String>,
    pub nom: Option<String>,
    pub role: String,
    pub entite: Option<EntiteRef>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct UserListResponse {
    pub items: Vec<UserView>,
    pub page: i64,
    pub total_pages: i64,
    pub total_results: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    prenom: Option<String>,
    nom: Option<String>,
    role: String,
    entite_id: Option<String>,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    entite_label: Option<String>,
}

impl From<UserRow> for UserView {
    fn from(row: UserRow) -> Self {
        let entite = row.entite_id.map(|id| {
            let label = row.entite_label.unwrap_or_else(|| id.clone());
            EntiteRef { id, label }
        });
        UserView {
            id: row.id,
            email: row.email,
            prenom: row.prenom,
            nom: row.nom,
            role: row.role,
            entite,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// GET /api/users
pub async fn list_users(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<UserListResponse>> {
    require_role(&ctx, Role::EntityAdmin)?;

    let scope = visible_entites(&state, &ctx).await?;

    let mut clauses: Vec<String> = Vec::new();
    match &scope {
        None => {}
        Some(ids) if ids.is_empty() => clauses.push("1 = 0".to_string()),
        Some(ids) => {
            let placeholders = vec!["?"; ids.len()].join(", ");
            clauses.push(format!(
                "(u.entite_id IN ({}) OR (u.entite_id IS NULL AND u.role = 'PENDING'))",
                placeholders
            ));
        }
    }

    let role_filter = match &query.role {
        Some(s) => {
            let role = Role::parse(s).map_err(|e| ApiError::BadRequest(e.to_string()))?;
            clauses.push("u.role = ?".to_string());
            Some(role)
        }
        None => None,
    };

    let search = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", s));
    if search.is_some() {
        clauses.push("(u.email LIKE ? OR u.nom LIKE ? OR u.prenom LIKE ?)".to_string());
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM users u {}", where_sql);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    if let Some(ids) = &scope {
        for id in ids {
            count_query = count_query.bind(id);
        }
    }
    if let Some(role) = role_filter {
        count_query = count_query.bind(role.as_str());
    }
    if let Some(like) = &search {
        count_query = count_query.bind(like).bind(like).bind(like);
    }
    let total_results = count_query.fetch_one(&state.db).await?;

    let pagination = calculate_pagination(total_results, query.page.unwrap_or(1));

    let rows_sql = format!(
        r#"
        SELECT u.id, u.email, u.prenom, u.nom, u.role, u.entite_id, u.active,
               u.created_at, u.updated_at, e.label AS entite_label
        FROM users u
        LEFT JOIN entites e ON e.id = u.entite_id
        {}
        ORDER BY u.email
        LIMIT ? OFFSET ?
        "#,
        where_sql
    );
    let mut rows_query = sqlx::query_as::<_, UserRow>(&rows_sql);
    if let Some(ids) = &scope {
        for id in ids {
            rows_query = rows_query.bind(id);
        }
    }
    if let Some(role) = role_filter {
        rows_query = rows_query.bind(role.as_str());
    }
    if let Some(like) = &search {
        rows_query = rows_query.bind(like).bind(like).bind(like);
    }
    let rows = rows_query
        .bind(PAGE_SIZE)
        .bind(pagination.offset)
        .fetch_all(&state.db)
        .await?;

    Ok(Json(UserListResponse {
        items: rows.into_iter().map(UserView::from).collect(),
        page: pagination.page,
        total_pages: pagination.total_pages,
        total_results,
    }))
}

/// GET /api/users/:id
pub async fn get_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<UserView>> {
    require_role(&ctx, Role::EntityAdmin)?;

    let scope = visible_entites(&state, &ctx).await?;
    let user = load_visible_user(&state, &scope, &id).await?;

    Ok(Json(user_view(&state, user).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub role: Option<String>,
    /// Explicit null detaches the user from any entity
    #[serde(default, deserialize_with = "deserialize_some")]
    pub entite_id: Option<Option<String>>,
    pub active: Option<bool>,
}

/// PATCH /api/users/:id
pub async fn update_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateUserRequest>,
) -> ApiResult<Json<UserView>> {
    require_role(&ctx, Role::EntityAdmin)?;

    if id == ctx.user_id {
        return Err(ApiError::BadRequest(
            "you cannot edit your own account here".to_string(),
        ));
    }

    let scope = visible_entites(&state, &ctx).await?;
    let user = load_visible_user(&state, &scope, &id).await?;

    let current_role = Role::parse(&user.role)
        .map_err(|_| ApiError::Internal("corrupt role in database".to_string()))?;
    if current_role > ctx.role {
        return Err(ApiError::Forbidden(
            "cannot edit a user with a higher role than yours".to_string(),
        ));
    }

    let new_role = match &body.role {
        Some(s) => {
            let role = Role::parse(s).map_err(|e| ApiError::BadRequest(e.to_string()))?;
            if role > ctx.role {
                return Err(ApiError::Forbidden(format!(
                    "you cannot grant the role {}",
                    role.as_str()
                )));
            }
            role
        }
        None => current_role,
    };

    let new_entite = match body.entite_id {
        Some(Some(entite_id)) => {
            let tree = state.entites.tree().await?;
            if !tree.contains(&entite_id) {
                return Err(ApiError::BadRequest(format!("unknown entity {}", entite_id)));
            }
            if let Some(ids) = &scope {
                if !ids.contains(&entite_id) {
                    return Err(ApiError::Forbidden(
                        "entity outside your scope".to_string(),
                    ));
                }
            }
            Some(entite_id)
        }
        Some(None) => None,
        None => user.entite_id.clone(),
    };

    let scoped_role = matches!(new_role, Role::Reader | Role::Writer | Role::EntityAdmin);
    if scoped_role && new_entite.is_none() {
        return Err(ApiError::BadRequest(format!(
            "role {} requires an entity",
            new_role.as_str()
        )));
    }

    let new_active = body.active.unwrap_or(user.active);

    sqlx::query(
        "UPDATE users SET role = ?, entite_id = ?, active = ?, updated_at = ? WHERE id = ?",
    )
    .bind(new_role.as_str())
    .bind(&new_entite)
    .bind(new_active)
    .bind(Utc::now())
    .bind(&id)
    .execute(&state.db)
    .await?;

    if user.active && !new_active {
        let revoked = session::delete_user_sessions(&state.db, &id).await?;
        info!(user_id = %id, revoked, "User deactivated, sessions revoked");
    }

    info!(
        user_id = %id,
        role = %new_role.as_str(),
        active = new_active,
        by = %ctx.user_id,
        "User updated"
    );

    let user = load_visible_user(&state, &scope, &id).await?;
    Ok(Json(user_view(&state, user).await?))
}

/// DELETE /api/users/:id
///
/// Soft delete: the account is deactivated and its sessions revoked, the
/// row stays for note authorship.
pub async fn deactivate_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_role(&ctx, Role::EntityAdmin)?;

    if id == ctx.user_id {
        return Err(ApiError::BadRequest(
            "you cannot deactivate yourself".to_string(),
        ));
    }

    let scope = visible_entites(&state, &ctx).await?;
    let user = load_visible_user(&state, &scope, &id).await?;

    let target_role = Role::parse(&user.role)
        .map_err(|_| ApiError::Internal("corrupt role in database".to_string()))?;
    if target_role > ctx.role {
        return Err(ApiError::Forbidden(
            "cannot deactivate a user with a higher role than yours".to_string(),
        ));
    }

    sqlx::query("UPDATE users SET active = 0, updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(&id)
        .execute(&state.db)
        .await?;

    let revoked = session::delete_user_sessions(&state.db, &id).await?;
    info!(user_id = %id, revoked, by = %ctx.user_id, "User deactivated");

    Ok(Json(serde_json::json!({ "status": "deactivated" })))
}

/// Load a user, 404 when absent or outside the caller's visibility
async fn load_visible_user(
    state: &AppState,
    scope: &Option<Vec<String>>,
    id: &str,
) -> ApiResult<User> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user {}", id)))?;

    let visible = match scope {
        None => true,
        Some(ids) => match &user.entite_id {
            Some(entite_id) => ids.contains(entite_id),
            None => user.role == "PENDING",
        },
    };
    if !visible {
        return Err(ApiError::NotFound(format!("user {}", id)));
    }

    Ok(user)
}

async fn user_view(state: &AppState, user: User) -> ApiResult<UserView> {
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

    Ok(UserView {
        id: user.id,
        email: user.email,
        prenom: user.prenom,
        nom: user.nom,
        role: user.role,
        entite,
        active: user.active,
        created_at: user.created_at,
        updated_at: user.updated_at,
    })
}
