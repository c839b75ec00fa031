//! Entity administration endpoints
//!
//! Reads serve from the cached tree snapshot. Mutations are SUPER_ADMIN
//! only, write straight to the database, and invalidate the snapshot.

use crate::api::{require_role, AuthContext};
use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sirena_common::db::models::Entite;
use sirena_common::Role;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

const CATEGORIES: [&str; 5] = ["ARS", "DD", "CD", "ORGANISME", "AUTRE"];

/// Distinguishes an absent field from an explicit null
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Minimal entity reference embedded in other responses
#[derive(Debug, Clone, Serialize)]
pub struct EntiteRef {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Serialize)]
pub struct EntiteView {
    pub id: String,
    pub nom: String,
    pub label: String,
    pub categorie: String,
    pub code: Option<String>,
    pub email: Option<String>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Entite> for EntiteView {
    fn from(e: &Entite) -> Self {
        Self {
            id: e.id.clone(),
            nom: e.nom.clone(),
            label: e.label.clone(),
            categorie: e.categorie.clone(),
            code: e.code.clone(),
            email: e.email.clone(),
            parent_id: e.parent_id.clone(),
            created_at: e.created_at,
            updated_at: e.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EntiteListResponse {
    pub items: Vec<EntiteView>,
    pub total: usize,
}

/// GET /api/entites
pub async fn list_entites(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<Json<EntiteListResponse>> {
    require_role(&ctx, Role::Reader)?;

    let tree = state.entites.tree().await?;
    let items: Vec<EntiteView> = tree.all().into_iter().map(EntiteView::from).collect();
    let total = items.len();

    Ok(Json(EntiteListResponse { items, total }))
}

/// GET /api/entites/:id
pub async fn get_entite(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<EntiteView>> {
    require_role(&ctx, Role::Reader)?;

    let tree = state.entites.tree().await?;
    let entite = tree
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("entity {}", id)))?;

    Ok(Json(EntiteView::from(entite)))
}

/// GET /api/entites/:id/descendants
///
/// The entity itself plus its whole subtree, for scope pickers.
pub async fn list_descendants(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<EntiteListResponse>> {
    require_role(&ctx, Role::Reader)?;

    let tree = state.entites.tree().await?;
    if !tree.contains(&id) {
        return Err(ApiError::NotFound(format!("entity {}", id)));
    }

    let items: Vec<EntiteView> = tree
        .descendants(&id)
        .iter()
        .filter_map(|descendant_id| tree.get(descendant_id))
        .map(EntiteView::from)
        .collect();
    let total = items.len();

    Ok(Json(EntiteListResponse { items, total }))
}

#[derive(Debug, Deserialize)]
pub struct CreateEntiteRequest {
    pub nom: String,
    pub label: String,
    pub categorie: String,
    pub code: Option<String>,
    pub email: Option<String>,
    pub parent_id: Option<String>,
}

/// POST /api/entites
pub async fn create_entite(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<CreateEntiteRequest>,
) -> ApiResult<impl IntoResponse> {
    require_role(&ctx, Role::SuperAdmin)?;

    if body.nom.trim().is_empty() || body.label.trim().is_empty() {
        return Err(ApiError::BadRequest("nom and label are required".to_string()));
    }
    validate_categorie(&body.categorie)?;

    if let Some(code) = &body.code {
        ensure_code_free(&state.db, code, None).await?;
    }
    if let Some(parent_id) = &body.parent_id {
        ensure_parent_exists(&state.db, parent_id).await?;
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO entites (id, nom, label, categorie, code, email, parent_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(body.nom.trim())
    .bind(body.label.trim())
    .bind(&body.categorie)
    .bind(&body.code)
    .bind(&body.email)
    .bind(&body.parent_id)
    .bind(now)
    .bind(now)
    .execute(&state.db)
    .await?;

    state.entites.invalidate();
    info!(entite_id = %id, by = %ctx.user_id, "Entity created");

    let entite = load_entite(&state.db, &id).await?;
    Ok((StatusCode::CREATED, Json(EntiteView::from(&entite))))
}

#[derive(Debug, Deserialize)]
pub struct UpdateEntiteRequest {
    pub nom: Option<String>,
    pub label: Option<String>,
    pub categorie: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub code: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub email: Option<Option<String>>,
    /// Explicit null detaches the entity to a root
    #[serde(default, deserialize_with = "deserialize_some")]
    pub parent_id: Option<Option<String>>,
}

/// PATCH /api/entites/:id
pub async fn update_entite(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateEntiteRequest>,
) -> ApiResult<Json<EntiteView>> {
    require_role(&ctx, Role::SuperAdmin)?;

    let mut entite = load_entite(&state.db, &id).await?;

    if let Some(nom) = body.nom {
        if nom.trim().is_empty() {
            return Err(ApiError::BadRequest("nom cannot be empty".to_string()));
        }
        entite.nom = nom.trim().to_string();
    }
    if let Some(label) = body.label {
        if label.trim().is_empty() {
            return Err(ApiError::BadRequest("label cannot be empty".to_string()));
        }
        entite.label = label.trim().to_string();
    }
    if let Some(categorie) = body.categorie {
        validate_categorie(&categorie)?;
        entite.categorie = categorie;
    }
    if let Some(code) = body.code {
        if let Some(code) = &code {
            ensure_code_free(&state.db, code, Some(&id)).await?;
        }
        entite.code = code;
    }
    if let Some(email) = body.email {
        entite.email = email;
    }
    if let Some(parent_id) = body.parent_id {
        if let Some(parent_id) = &parent_id {
            ensure_parent_exists(&state.db, parent_id).await?;
            if creates_cycle(&state.db, &id, parent_id).await? {
                return Err(ApiError::BadRequest("invalid_parent: would create a cycle".to_string()));
            }
        }
        entite.parent_id = parent_id;
    }

    sqlx::query(
        "UPDATE entites SET nom = ?, label = ?, categorie = ?, code = ?, email = ?, parent_id = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&entite.nom)
    .bind(&entite.label)
    .bind(&entite.categorie)
    .bind(&entite.code)
    .bind(&entite.email)
    .bind(&entite.parent_id)
    .bind(Utc::now())
    .bind(&id)
    .execute(&state.db)
    .await?;

    state.entites.invalidate();
    info!(entite_id = %id, by = %ctx.user_id, "Entity updated");

    let entite = load_entite(&state.db, &id).await?;
    Ok(Json(EntiteView::from(&entite)))
}

/// DELETE /api/entites/:id
///
/// Refused while anything still references the entity.
pub async fn delete_entite(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_role(&ctx, Role::SuperAdmin)?;

    load_entite(&state.db, &id).await?;

    let children: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entites WHERE parent_id = ?")
        .bind(&id)
        .fetch_one(&state.db)
        .await?;
    if children > 0 {
        return Err(ApiError::Conflict(format!(
            "entity has {} child entities",
            children
        )));
    }

    let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE entite_id = ?")
        .bind(&id)
        .fetch_one(&state.db)
        .await?;
    if users > 0 {
        return Err(ApiError::Conflict(format!("entity has {} assigned users", users)));
    }

    let routings: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM requete_entites WHERE entite_id = ?")
            .bind(&id)
            .fetch_one(&state.db)
            .await?;
    if routings > 0 {
        return Err(ApiError::Conflict(format!(
            "entity has {} routed requêtes",
            routings
        )));
    }

    sqlx::query("DELETE FROM entites WHERE id = ?")
        .bind(&id)
        .execute(&state.db)
        .await?;

    state.entites.invalidate();
    info!(entite_id = %id, by = %ctx.user_id, "Entity deleted");

    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

fn validate_categorie(categorie: &str) -> ApiResult<()> {
    if CATEGORIES.contains(&categorie) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "categorie must be one of {}",
            CATEGORIES.join(", ")
        )))
    }
}

async fn load_entite(db: &SqlitePool, id: &str) -> ApiResult<Entite> {
    sqlx::query_as::<_, Entite>("SELECT * FROM entites WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("entity {}", id)))
}

async fn ensure_code_free(db: &SqlitePool, code: &str, except_id: Option<&str>) -> ApiResult<()> {
    let holder: Option<String> =
        sqlx::query_scalar("SELECT id FROM entites WHERE lower(code) = lower(?)")
            .bind(code)
            .fetch_optional(db)
            .await?;

    match holder {
        Some(id) if Some(id.as_str()) != except_id => Err(ApiError::Conflict(format!(
            "code {} is already in use",
            code
        ))),
        _ => Ok(()),
    }
}

async fn ensure_parent_exists(db: &SqlitePool, parent_id: &str) -> ApiResult<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM entites WHERE id = ?)")
        .bind(parent_id)
        .fetch_one(db)
        .await?;

    if exists {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "invalid_parent: entity {} does not exist",
            parent_id
        )))
    }
}

/// Walk up from `new_parent_id`; reaching `entite_id` means a cycle
async fn creates_cycle(db: &SqlitePool, entite_id: &str, new_parent_id: &str) -> ApiResult<bool> {
    let mut current = Some(new_parent_id.to_string());
    let mut hops = 0;

    while let Some(id) = current {
        if id == entite_id {
            return Ok(true);
        }
        hops += 1;
        if hops > 1000 {
            return Ok(true);
        }
        current = sqlx::query_scalar::<_, Option<String>>(
            "SELECT parent_id FROM entites WHERE id = ?",
        )
        .bind(&id)
        .fetch_optional(db)
        .await?
        .flatten();
    }

    Ok(false)
}
