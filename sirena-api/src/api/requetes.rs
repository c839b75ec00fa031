//! Requête endpoints
//!
//! Listing is routing-row-centric: a requête routed to several entities
//! appears once per routing row the caller can see. Scoped callers only see
//! rows inside their entity subtree; unrouted rows (NULL entity) are
//! reserved to national roles.

use crate::api::entites::EntiteRef;
use crate::api::{require_role, visible_entites, AuthContext};
use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sirena_common::db::models::{ReceptionType, Requete, RequeteEntite, Statut};
use sirena_common::db::requetes as db_requetes;
use sirena_common::pagination::{calculate_pagination, PAGE_SIZE};
use sirena_common::Role;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub statut: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RequeteListItem {
    pub id: String,
    pub numero: i64,
    pub reception_date: DateTime<Utc>,
    pub reception_type: String,
    pub commune: Option<String>,
    pub declarant_prenom: Option<String>,
    pub declarant_nom: Option<String>,
    pub statut: String,
    pub entite: Option<EntiteRef>,
}

#[derive(Debug, Serialize)]
pub struct RequeteListResponse {
    pub items: Vec<RequeteListItem>,
    pub page: i64,
    pub total_pages: i64,
    pub total_results: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ListRow {
    requete_id: String,
    numero: i64,
    reception_date: DateTime<Utc>,
    reception_type: String,
    commune: Option<String>,
    declarant_prenom: Option<String>,
    declarant_nom: Option<String>,
    statut: String,
    entite_id: Option<String>,
    entite_label: Option<String>,
}

/// GET /api/requetes
pub async fn list_requetes(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<RequeteListResponse>> {
    require_role(&ctx, Role::Reader)?;

    let scope = visible_entites(&state, &ctx).await?;

    let mut clauses: Vec<String> = Vec::new();
    match &scope {
        None => {}
        Some(ids) if ids.is_empty() => clauses.push("1 = 0".to_string()),
        Some(ids) => {
            let placeholders = vec!["?"; ids.len()].join(", ");
            clauses.push(format!("re.entite_id IN ({})", placeholders));
        }
    }

    let statut_filter = match &query.statut {
        Some(s) => {
            let statut = Statut::parse(s).map_err(|e| ApiError::BadRequest(e.to_string()))?;
            clauses.push("re.statut = ?".to_string());
            Some(statut)
        }
        None => None,
    };

    let search = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let numero_search: Option<i64> = search.as_deref().and_then(|s| s.parse().ok());
    if search.is_some() {
        if numero_search.is_some() {
            clauses.push(
                "(r.numero = ? OR r.declarant_nom LIKE ? OR r.declarant_prenom LIKE ? OR r.commune LIKE ?)"
                    .to_string(),
            );
        } else {
            clauses.push(
                "(r.declarant_nom LIKE ? OR r.declarant_prenom LIKE ? OR r.commune LIKE ?)"
                    .to_string(),
            );
        }
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let like = search.as_deref().map(|s| format!("%{}%", s));

    let count_sql = format!(
        "SELECT COUNT(*) FROM requete_entites re JOIN requetes r ON r.id = re.requete_id {}",
        where_sql
    );
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    if let Some(ids) = &scope {
        for id in ids {
            count_query = count_query.bind(id);
        }
    }
    if let Some(statut) = statut_filter {
        count_query = count_query.bind(statut.as_str());
    }
    if let Some(numero) = numero_search {
        count_query = count_query.bind(numero);
    }
    if let Some(like) = &like {
        count_query = count_query.bind(like).bind(like).bind(like);
    }
    let total_results = count_query.fetch_one(&state.db).await?;

    let pagination = calculate_pagination(total_results, query.page.unwrap_or(1));

    let rows_sql = format!(
        r#"
        SELECT r.id AS requete_id, r.numero, r.reception_date, r.reception_type,
               r.commune, r.declarant_prenom, r.declarant_nom,
               re.statut, re.entite_id, e.label AS entite_label
        FROM requete_entites re
        JOIN requetes r ON r.id = re.requete_id
        LEFT JOIN entites e ON e.id = re.entite_id
        {}
        ORDER BY r.reception_date DESC, r.numero DESC
        LIMIT ? OFFSET ?
        "#,
        where_sql
    );
    let mut rows_query = sqlx::query_as::<_, ListRow>(&rows_sql);
    if let Some(ids) = &scope {
        for id in ids {
            rows_query = rows_query.bind(id);
        }
    }
    if let Some(statut) = statut_filter {
        rows_query = rows_query.bind(statut.as_str());
    }
    if let Some(numero) = numero_search {
        rows_query = rows_query.bind(numero);
    }
    if let Some(like) = &like {
        rows_query = rows_query.bind(like).bind(like).bind(like);
    }
    let rows = rows_query
        .bind(PAGE_SIZE)
        .bind(pagination.offset)
        .fetch_all(&state.db)
        .await?;

    let items = rows
        .into_iter()
        .map(|row| {
            let entite = row.entite_id.map(|id| {
                let label = row.entite_label.unwrap_or_else(|| id.clone());
                EntiteRef { id, label }
            });
            RequeteListItem {
                id: row.requete_id,
                numero: row.numero,
                reception_date: row.reception_date,
                reception_type: row.reception_type,
                commune: row.commune,
                declarant_prenom: row.declarant_prenom,
                declarant_nom: row.declarant_nom,
                statut: row.statut,
                entite,
            }
        })
        .collect();

    Ok(Json(RequeteListResponse {
        items,
        page: pagination.page,
        total_pages: pagination.total_pages,
        total_results,
    }))
}

#[derive(Debug, Serialize)]
pub struct RoutingView {
    pub id: String,
    pub entite: Option<EntiteRef>,
    pub statut: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct AuthorRef {
    pub id: String,
    pub email: String,
    pub prenom: Option<String>,
    pub nom: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FileRef {
    pub id: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub scan_status: String,
}

#[derive(Debug, Serialize)]
pub struct NoteView {
    pub id: String,
    pub routing_id: String,
    pub author: AuthorRef,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<FileRef>,
}

#[derive(Debug, Serialize)]
pub struct RequeteDetail {
    pub id: String,
    pub numero: i64,
    pub dematsocial_id: Option<i64>,
    pub reception_date: DateTime<Utc>,
    pub reception_type: String,
    pub commune: Option<String>,
    pub declarant_civilite: Option<String>,
    pub declarant_prenom: Option<String>,
    pub declarant_nom: Option<String>,
    pub declarant_email: Option<String>,
    pub declarant_telephone: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub routings: Vec<RoutingView>,
    pub notes: Vec<NoteView>,
}

#[derive(Debug, sqlx::FromRow)]
struct RoutingRow {
    id: String,
    entite_id: Option<String>,
    statut: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    entite_label: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct NoteRow {
    id: String,
    requete_entite_id: String,
    content: String,
    created_at: DateTime<Utc>,
    author_id: String,
    author_email: String,
    author_prenom: Option<String>,
    author_nom: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct FileRow {
    id: String,
    note_id: String,
    file_name: String,
    content_type: String,
    size_bytes: i64,
    scan_status: String,
}

/// GET /api/requetes/:id
///
/// Scoped callers get only the routing rows (and their notes) inside their
/// subtree; a requête with no in-scope routing row does not exist for them.
pub async fn get_requete(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<RequeteDetail>> {
    require_role(&ctx, Role::Reader)?;

    let requete = sqlx::query_as::<_, Requete>("SELECT * FROM requetes WHERE id = ?")
        .bind(&id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("requête {}", id)))?;

    let scope = visible_entites(&state, &ctx).await?;

    let mut routings = sqlx::query_as::<_, RoutingRow>(
        r#"
        SELECT re.id, re.entite_id, re.statut, re.created_at, re.updated_at,
               e.label AS entite_label
        FROM requete_entites re
        LEFT JOIN entites e ON e.id = re.entite_id
        WHERE re.requete_id = ?
        ORDER BY re.created_at
        "#,
    )
    .bind(&id)
    .fetch_all(&state.db)
    .await?;

    if let Some(ids) = &scope {
        routings.retain(|r| r.entite_id.as_ref().map(|e| ids.contains(e)).unwrap_or(false));
        if routings.is_empty() {
            return Err(ApiError::NotFound(format!("requête {}", id)));
        }
    }

    let routing_ids: Vec<String> = routings.iter().map(|r| r.id.clone()).collect();
    let placeholders = vec!["?"; routing_ids.len()].join(", ");

    let notes_sql = format!(
        r#"
        SELECT n.id, n.requete_entite_id, n.content, n.created_at,
               u.id AS author_id, u.email AS author_email,
               u.prenom AS author_prenom, u.nom AS author_nom
        FROM requete_notes n
        JOIN users u ON u.id = n.author_id
        WHERE n.requete_entite_id IN ({})
        ORDER BY n.created_at
        "#,
        placeholders
    );
    let mut notes_query = sqlx::query_as::<_, NoteRow>(&notes_sql);
    for routing_id in &routing_ids {
        notes_query = notes_query.bind(routing_id);
    }
    let note_rows = notes_query.fetch_all(&state.db).await?;

    let mut files_by_note: HashMap<String, Vec<FileRef>> = HashMap::new();
    if !note_rows.is_empty() {
        let note_placeholders = vec!["?"; note_rows.len()].join(", ");
        let files_sql = format!(
            r#"
            SELECT id, note_id, file_name, content_type, size_bytes, scan_status
            FROM uploaded_files
            WHERE note_id IN ({})
            ORDER BY created_at
            "#,
            note_placeholders
        );
        let mut files_query = sqlx::query_as::<_, FileRow>(&files_sql);
        for note in &note_rows {
            files_query = files_query.bind(&note.id);
        }
        for file in files_query.fetch_all(&state.db).await? {
            files_by_note.entry(file.note_id.clone()).or_default().push(FileRef {
                id: file.id,
                file_name: file.file_name,
                content_type: file.content_type,
                size_bytes: file.size_bytes,
                scan_status: file.scan_status,
            });
        }
    }

    let notes = note_rows
        .into_iter()
        .map(|n| {
            let files = files_by_note.remove(&n.id).unwrap_or_default();
            NoteView {
                id: n.id,
                routing_id: n.requete_entite_id,
                author: AuthorRef {
                    id: n.author_id,
                    email: n.author_email,
                    prenom: n.author_prenom,
                    nom: n.author_nom,
                },
                content: n.content,
                created_at: n.created_at,
                files,
            }
        })
        .collect();

    let routings = routings
        .into_iter()
        .map(|r| {
            let entite = r.entite_id.map(|eid| {
                let label = r.entite_label.unwrap_or_else(|| eid.clone());
                EntiteRef { id: eid, label }
            });
            RoutingView {
                id: r.id,
                entite,
                statut: r.statut,
                created_at: r.created_at,
                updated_at: r.updated_at,
            }
        })
        .collect();

    Ok(Json(RequeteDetail {
        id: requete.id,
        numero: requete.numero,
        dematsocial_id: requete.dematsocial_id,
        reception_date: requete.reception_date,
        reception_type: requete.reception_type,
        commune: requete.commune,
        declarant_civilite: requete.declarant_civilite,
        declarant_prenom: requete.declarant_prenom,
        declarant_nom: requete.declarant_nom,
        declarant_email: requete.declarant_email,
        declarant_telephone: requete.declarant_telephone,
        description: requete.description,
        created_at: requete.created_at,
        updated_at: requete.updated_at,
        routings,
        notes,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateRequeteRequest {
    pub reception_date: Option<DateTime<Utc>>,
    pub reception_type: Option<String>,
    pub commune: Option<String>,
    pub declarant_civilite: Option<String>,
    pub declarant_prenom: Option<String>,
    pub declarant_nom: Option<String>,
    pub declarant_email: Option<String>,
    pub declarant_telephone: Option<String>,
    pub description: Option<String>,
    /// National roles only; scoped writers always create for their own entity
    pub entite_id: Option<String>,
}

/// POST /api/requetes
pub async fn create_requete(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<CreateRequeteRequest>,
) -> ApiResult<impl IntoResponse> {
    require_role(&ctx, Role::Writer)?;

    let reception_type = match &body.reception_type {
        Some(s) => ReceptionType::parse(s).map_err(|e| ApiError::BadRequest(e.to_string()))?,
        None => ReceptionType::Formulaire,
    };

    let target = if ctx.role.is_national() {
        body.entite_id.clone()
    } else {
        let own = ctx.entite_id.clone().ok_or_else(|| {
            ApiError::BadRequest("no entity assigned to your account".to_string())
        })?;
        match &body.entite_id {
            None => Some(own),
            Some(e) if *e == own => Some(own),
            Some(_) => {
                return Err(ApiError::Forbidden(
                    "requêtes are created for your own entity".to_string(),
                ))
            }
        }
    };

    if let Some(target_id) = &target {
        let tree = state.entites.tree().await?;
        if !tree.contains(target_id) {
            return Err(ApiError::BadRequest(format!(
                "unknown entity {}",
                target_id
            )));
        }
    }

    let new = db_requetes::NewRequete {
        dematsocial_id: None,
        reception_date: body.reception_date.unwrap_or_else(Utc::now),
        reception_type,
        commune: body.commune,
        declarant_civilite: body.declarant_civilite,
        declarant_prenom: body.declarant_prenom,
        declarant_nom: body.declarant_nom,
        declarant_email: body.declarant_email,
        declarant_telephone: body.declarant_telephone,
        description: body.description,
    };

    let mut tx = state.db.begin().await?;
    let (id, numero) = db_requetes::create_requete(&mut tx, &new, target.as_deref()).await?;
    tx.commit().await?;

    info!(requete_id = %id, numero, by = %ctx.user_id, "Requête created");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": id, "numero": numero })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatutRequest {
    pub statut: String,
    /// Names the routing row when the requête is routed to several entities
    pub entite_id: Option<String>,
}

/// PATCH /api/requetes/:id/statut
pub async fn update_statut(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateStatutRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_role(&ctx, Role::Writer)?;

    let new_statut =
        Statut::parse(&body.statut).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let scope = visible_entites(&state, &ctx).await?;
    ensure_visible(&state, &scope, &id).await?;

    let routing = resolve_routing(&state, &ctx, &scope, &id, body.entite_id).await?;

    let current = Statut::parse(&routing.statut)
        .map_err(|_| ApiError::Internal("corrupt statut in database".to_string()))?;
    if current == Statut::Cloturee
        && new_statut != Statut::Cloturee
        && !ctx.role.at_least(Role::EntityAdmin)
    {
        return Err(ApiError::Forbidden(
            "reopening a closed requête requires ENTITY_ADMIN or above".to_string(),
        ));
    }

    sqlx::query("UPDATE requete_entites SET statut = ?, updated_at = ? WHERE id = ?")
        .bind(new_statut.as_str())
        .bind(Utc::now())
        .bind(&routing.id)
        .execute(&state.db)
        .await?;

    info!(
        requete_id = %id,
        routing_id = %routing.id,
        from = %current.as_str(),
        to = %new_statut.as_str(),
        by = %ctx.user_id,
        "Statut updated"
    );

    Ok(Json(serde_json::json!({
        "routing_id": routing.id,
        "statut": new_statut.as_str(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateNoteRequest {
    pub content: String,
    /// Names the routing row when the requête is routed to several entities
    pub entite_id: Option<String>,
    #[serde(default)]
    pub file_ids: Vec<String>,
}

/// POST /api/requetes/:id/notes
///
/// Attached files must belong to the caller and not already hang off
/// another note.
pub async fn create_note(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<CreateNoteRequest>,
) -> ApiResult<impl IntoResponse> {
    require_role(&ctx, Role::Writer)?;

    let content = body.content.trim();
    if content.is_empty() {
        return Err(ApiError::BadRequest("note content cannot be empty".to_string()));
    }

    let scope = visible_entites(&state, &ctx).await?;
    ensure_visible(&state, &scope, &id).await?;

    let routing = resolve_routing(&state, &ctx, &scope, &id, body.entite_id).await?;

    let note_id = Uuid::new_v4().to_string();
    let mut tx = state.db.begin().await?;

    sqlx::query(
        "INSERT INTO requete_notes (id, requete_entite_id, author_id, content, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&note_id)
    .bind(&routing.id)
    .bind(&ctx.user_id)
    .bind(content)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    for file_id in &body.file_ids {
        let updated = sqlx::query(
            "UPDATE uploaded_files SET note_id = ?
             WHERE id = ? AND uploaded_by = ? AND note_id IS NULL",
        )
        .bind(&note_id)
        .bind(file_id)
        .bind(&ctx.user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(ApiError::BadRequest(format!(
                "file {} cannot be attached",
                file_id
            )));
        }
    }

    tx.commit().await?;

    info!(
        requete_id = %id,
        routing_id = %routing.id,
        note_id = %note_id,
        files = body.file_ids.len(),
        by = %ctx.user_id,
        "Note added"
    );

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": note_id })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RerouteRequest {
    /// Source routing row; defaults to the caller's entity, or the only
    /// routing row for national callers
    pub from_entite_id: Option<String>,
    pub entite_id: String,
}

/// PATCH /api/requetes/:id/entite
///
/// Re-routing hands the requête to another entity and resets its statut.
pub async fn reroute(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<RerouteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_role(&ctx, Role::EntityAdmin)?;

    let scope = visible_entites(&state, &ctx).await?;
    ensure_visible(&state, &scope, &id).await?;

    let tree = state.entites.tree().await?;
    if !tree.contains(&body.entite_id) {
        return Err(ApiError::BadRequest(format!(
            "unknown entity {}",
            body.entite_id
        )));
    }
    if let Some(ids) = &scope {
        if !ids.contains(&body.entite_id) {
            return Err(ApiError::Forbidden(
                "destination entity outside your scope".to_string(),
            ));
        }
    }

    let routing = resolve_routing(&state, &ctx, &scope, &id, body.from_entite_id).await?;

    let already_routed: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM requete_entites WHERE requete_id = ? AND entite_id = ? AND id != ?)",
    )
    .bind(&id)
    .bind(&body.entite_id)
    .bind(&routing.id)
    .fetch_one(&state.db)
    .await?;
    if already_routed {
        return Err(ApiError::Conflict(format!(
            "requête already routed to entity {}",
            body.entite_id
        )));
    }

    sqlx::query(
        "UPDATE requete_entites SET entite_id = ?, statut = 'A_QUALIFIER', updated_at = ? WHERE id = ?",
    )
    .bind(&body.entite_id)
    .bind(Utc::now())
    .bind(&routing.id)
    .execute(&state.db)
    .await?;

    info!(
        requete_id = %id,
        routing_id = %routing.id,
        from = ?routing.entite_id,
        to = %body.entite_id,
        by = %ctx.user_id,
        "Requête re-routed"
    );

    Ok(Json(serde_json::json!({
        "routing_id": routing.id,
        "entite_id": body.entite_id,
        "statut": Statut::AQualifier.as_str(),
    })))
}

/// 404 unless the requête exists and has at least one routing row the
/// caller can see
async fn ensure_visible(
    state: &AppState,
    scope: &Option<Vec<String>>,
    requete_id: &str,
) -> ApiResult<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM requetes WHERE id = ?)")
        .bind(requete_id)
        .fetch_one(&state.db)
        .await?;
    if !exists {
        return Err(ApiError::NotFound(format!("requête {}", requete_id)));
    }

    match scope {
        None => Ok(()),
        Some(ids) if ids.is_empty() => Err(ApiError::NotFound(format!("requête {}", requete_id))),
        Some(ids) => {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!(
                "SELECT EXISTS(SELECT 1 FROM requete_entites WHERE requete_id = ? AND entite_id IN ({}))",
                placeholders
            );
            let mut query = sqlx::query_scalar::<_, bool>(&sql).bind(requete_id);
            for id in ids {
                query = query.bind(id);
            }
            if query.fetch_one(&state.db).await? {
                Ok(())
            } else {
                Err(ApiError::NotFound(format!("requête {}", requete_id)))
            }
        }
    }
}

/// Pick the routing row a statut change, note or re-route applies to.
///
/// Scoped callers default to their own entity; national callers must name
/// the entity unless the requête has a single routing row.
async fn resolve_routing(
    state: &AppState,
    ctx: &AuthContext,
    scope: &Option<Vec<String>>,
    requete_id: &str,
    param_entite: Option<String>,
) -> ApiResult<RequeteEntite> {
    let target = match (param_entite, &ctx.entite_id, scope) {
        (Some(t), _, _) => Some(t),
        (None, Some(own), Some(_)) => Some(own.clone()),
        _ => None,
    };

    match target {
        Some(entite_id) => {
            if let Some(ids) = scope {
                if !ids.contains(&entite_id) {
                    return Err(ApiError::Forbidden(
                        "entity outside your scope".to_string(),
                    ));
                }
            }
            sqlx::query_as::<_, RequeteEntite>(
                "SELECT * FROM requete_entites WHERE requete_id = ? AND entite_id = ?",
            )
            .bind(requete_id)
            .bind(&entite_id)
            .fetch_optional(&state.db)
            .await?
            .ok_or_else(|| {
                ApiError::NotFound(format!("no routing of this requête to entity {}", entite_id))
            })
        }
        None => {
            let mut rows = sqlx::query_as::<_, RequeteEntite>(
                "SELECT * FROM requete_entites WHERE requete_id = ?",
            )
            .bind(requete_id)
            .fetch_all(&state.db)
            .await?;

            match rows.len() {
                0 => Err(ApiError::NotFound(format!("requête {}", requete_id))),
                1 => Ok(rows.remove(0)),
                _ => Err(ApiError::BadRequest(
                    "entite_id is required when a requête has several routing rows".to_string(),
                )),
            }
        }
    }
}
