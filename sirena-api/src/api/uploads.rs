//! File upload endpoints
//!
//! Files are scanned by clamd before anything touches the disk or the
//! database. Stored bytes live under the uploads directory named by their
//! row id, with no extension; the original filename only reappears in the
//! download Content-Disposition.

use crate::api::{require_role, visible_entites, AuthContext};
use crate::error::{ApiError, ApiResult};
use crate::services::ScanVerdict;
use crate::AppState;
use axum::{
    extract::{Extension, Multipart, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sirena_common::db::models::UploadedFile;
use sirena_common::db::settings::get_setting_i64;
use sirena_common::Role;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

/// Hard cap on the request body, above any configured limit
pub const UPLOAD_BODY_CAP: usize = 64 * 1024 * 1024;

const DEFAULT_MAX_BYTES: i64 = 10 * 1024 * 1024;

const ALLOWED_CONTENT_TYPES: [&str; 7] = [
    "application/pdf",
    "image/jpeg",
    "image/png",
    "image/tiff",
    "application/vnd.oasis.opendocument.text",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/plain",
];

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub id: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub scan_status: String,
}

/// POST /api/uploads
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    require_role(&ctx, Role::Writer)?;

    let mut upload: Option<(String, String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("document").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?;
        upload = Some((file_name, content_type, data.to_vec()));
        break;
    }
    let (file_name, content_type, data) =
        upload.ok_or_else(|| ApiError::BadRequest("missing file field".to_string()))?;

    let max_bytes = get_setting_i64(&state.db, "upload_max_bytes", DEFAULT_MAX_BYTES).await?;
    if data.len() as i64 > max_bytes {
        return Err(ApiError::PayloadTooLarge(format!(
            "file exceeds the {} byte limit",
            max_bytes
        )));
    }

    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if !ALLOWED_CONTENT_TYPES.contains(&essence.as_str()) {
        return Err(ApiError::UnsupportedMediaType(format!(
            "content type {} is not accepted",
            essence
        )));
    }

    let scan_status = if state.clamd.enabled() {
        match state.clamd.scan(&data).await {
            Ok(ScanVerdict::Clean) => "CLEAN",
            Ok(ScanVerdict::Infected(signature)) => {
                warn!(
                    file_name = %file_name,
                    signature = %signature,
                    by = %ctx.user_id,
                    "Upload rejected, infected"
                );
                return Err(ApiError::Unprocessable("file_infected".to_string()));
            }
            Err(e) => {
                warn!("clamd scan failed: {}", e);
                return Err(ApiError::BadGateway("scan_unavailable".to_string()));
            }
        }
    } else {
        warn!("Virus scanning disabled, storing file unscanned");
        "PENDING"
    };

    let digest = Sha256::digest(&data);
    let sha256: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

    let id = Uuid::new_v4().to_string();
    tokio::fs::create_dir_all(&state.uploads_dir).await?;
    tokio::fs::write(state.uploads_dir.join(&id), &data).await?;

    let size_bytes = data.len() as i64;
    sqlx::query(
        r#"
        INSERT INTO uploaded_files (
            id, note_id, file_name, content_type, size_bytes, path, sha256,
            scan_status, uploaded_by, created_at
        ) VALUES (?, NULL, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&file_name)
    .bind(&essence)
    .bind(size_bytes)
    .bind(&id)
    .bind(&sha256)
    .bind(scan_status)
    .bind(&ctx.user_id)
    .bind(Utc::now())
    .execute(&state.db)
    .await?;

    info!(
        file_id = %id,
        file_name = %file_name,
        size_bytes,
        scan_status,
        by = %ctx.user_id,
        "File uploaded"
    );

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            id,
            file_name,
            content_type: essence,
            size_bytes,
            sha256,
            scan_status: scan_status.to_string(),
        }),
    ))
}

/// GET /api/uploads/:id
///
/// Infected files (and files whose scan errored) are never served.
pub async fn download_file(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    require_role(&ctx, Role::Reader)?;

    let file = load_file(&state.db, &id).await?;
    if file.scan_status == "INFECTED" || file.scan_status == "ERROR" {
        return Err(ApiError::NotFound(format!("file {}", id)));
    }

    if !can_see_file(&state, &ctx, &file).await? {
        return Err(ApiError::NotFound(format!("file {}", id)));
    }

    let bytes = match tokio::fs::read(state.uploads_dir.join(&file.path)).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(file_id = %id, "Upload bytes missing from disk");
            return Err(ApiError::NotFound(format!("file {}", id)));
        }
        Err(e) => return Err(e.into()),
    };

    let safe_name: String = file
        .file_name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '"' { '_' } else { c })
        .collect();
    let disposition = format!("attachment; filename=\"{}\"", safe_name);

    Ok((
        [
            (header::CONTENT_TYPE, file.content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

/// DELETE /api/uploads/:id
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_role(&ctx, Role::Reader)?;

    let file = load_file(&state.db, &id).await?;

    let allowed = if file.uploaded_by == ctx.user_id {
        true
    } else if ctx.role.at_least(Role::EntityAdmin) {
        // Admins only reach files attached inside their scope
        file.note_id.is_some() && can_see_file(&state, &ctx, &file).await?
    } else {
        false
    };
    if !allowed {
        return Err(ApiError::NotFound(format!("file {}", id)));
    }

    match tokio::fs::remove_file(state.uploads_dir.join(&file.path)).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(file_id = %id, "Upload bytes already gone from disk");
        }
        Err(e) => return Err(e.into()),
    }

    sqlx::query("DELETE FROM uploaded_files WHERE id = ?")
        .bind(&id)
        .execute(&state.db)
        .await?;

    info!(file_id = %id, by = %ctx.user_id, "File deleted");

    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

async fn load_file(db: &SqlitePool, id: &str) -> ApiResult<UploadedFile> {
    sqlx::query_as::<_, UploadedFile>("SELECT * FROM uploaded_files WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("file {}", id)))
}

/// Attached files follow the routing scope of their note's requête;
/// unattached files are only visible to their uploader.
async fn can_see_file(state: &AppState, ctx: &AuthContext, file: &UploadedFile) -> ApiResult<bool> {
    if file.uploaded_by == ctx.user_id {
        return Ok(true);
    }

    let note_id = match &file.note_id {
        Some(note_id) => note_id,
        None => return Ok(false),
    };

    let entite: Option<String> = sqlx::query_scalar(
        r#"
        SELECT re.entite_id
        FROM requete_notes n
        JOIN requete_entites re ON re.id = n.requete_entite_id
        WHERE n.id = ?
        "#,
    )
    .bind(note_id)
    .fetch_optional(&state.db)
    .await?
    .flatten();

    let scope = visible_entites(state, ctx).await?;
    Ok(match scope {
        None => true,
        Some(ids) => entite.map(|e| ids.contains(&e)).unwrap_or(false),
    })
}
