//! Import run loop
//!
//! One run pages through the démarche's dossiers and upserts them as
//! requêtes, keyed by `dematsocial_id`. Every dossier commits in its own
//! transaction, so an aborted run never leaves a half-written requête.

use crate::dematsocial::{DematSocialClient, Dossier};
use crate::mapper::map_dossier;
use chrono::{DateTime, SecondsFormat, Utc};
use sirena_common::db::models::ImportRun;
use sirena_common::db::requetes as db_requetes;
use sirena_common::db::settings::{get_setting, get_setting_i64, set_setting};
use sirena_common::Result;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{error, info, warn};
use uuid::Uuid;

/// What became of one dossier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DossierOutcome {
    Created { unrouted: bool },
    Updated,
    Skipped,
}

/// Per-run counters, written to the run row on close
#[derive(Debug, Default, Clone, Copy)]
pub struct RunCounters {
    pub dossiers_seen: i64,
    pub created: i64,
    pub updated: i64,
    pub skipped: i64,
    pub unrouted: i64,
    pub failed: i64,
}

/// Upsert one dossier in its own transaction
///
/// An unseen dossier becomes a requête with one routing row, routed via the
/// entity code champ (unknown code → unrouted). A seen dossier is refreshed
/// only while every routing row is still A_QUALIFIER and the dossier was
/// modified since our copy; anything an agent started working on is never
/// overwritten.
pub async fn process_dossier(pool: &SqlitePool, dossier: &Dossier) -> Result<DossierOutcome> {
    let mapped = map_dossier(dossier);
    let mut tx = pool.begin().await?;

    let existing: Option<(String, DateTime<Utc>)> =
        sqlx::query_as("SELECT id, updated_at FROM requetes WHERE dematsocial_id = ?")
            .bind(dossier.number)
            .fetch_optional(&mut *tx)
            .await?;

    let Some((requete_id, our_updated_at)) = existing else {
        let entite_id = match &mapped.entite_code {
            Some(code) => {
                let id = find_entite_by_code(&mut tx, code).await?;
                if id.is_none() {
                    warn!(
                        dossier = dossier.number,
                        code = %code,
                        "No entity matches the routing code, leaving unrouted"
                    );
                }
                id
            }
            None => None,
        };
        let unrouted = entite_id.is_none();

        db_requetes::create_requete(&mut tx, &mapped.requete, entite_id.as_deref()).await?;
        tx.commit().await?;

        return Ok(DossierOutcome::Created { unrouted });
    };

    let touched: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM requete_entites WHERE requete_id = ? AND statut != 'A_QUALIFIER')",
    )
    .bind(&requete_id)
    .fetch_one(&mut *tx)
    .await?;

    if touched || dossier.date_derniere_modification <= our_updated_at {
        return Ok(DossierOutcome::Skipped);
    }

    sqlx::query(
        r#"
        UPDATE requetes SET
            commune = ?,
            declarant_civilite = ?,
            declarant_prenom = ?,
            declarant_nom = ?,
            declarant_email = ?,
            description = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&mapped.requete.commune)
    .bind(&mapped.requete.declarant_civilite)
    .bind(&mapped.requete.declarant_prenom)
    .bind(&mapped.requete.declarant_nom)
    .bind(&mapped.requete.declarant_email)
    .bind(&mapped.requete.description)
    .bind(Utc::now())
    .bind(&requete_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(DossierOutcome::Updated)
}

async fn find_entite_by_code(conn: &mut SqliteConnection, code: &str) -> Result<Option<String>> {
    let id = sqlx::query_scalar(
        "SELECT id FROM entites WHERE code IS NOT NULL AND lower(code) = lower(?)",
    )
    .bind(code)
    .fetch_optional(conn)
    .await?;
    Ok(id)
}

/// Open a RUNNING import_runs row
pub async fn start_run(pool: &SqlitePool) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO import_runs (id, started_at, status) VALUES (?, ?, 'RUNNING')")
        .bind(&id)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(id)
}

/// Close a run with its final status and counters
pub async fn finish_run(
    pool: &SqlitePool,
    run_id: &str,
    status: &str,
    counters: &RunCounters,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_runs SET
            status = ?,
            ended_at = ?,
            dossiers_seen = ?,
            created = ?,
            updated = ?,
            skipped = ?,
            unrouted = ?,
            failed = ?,
            error = ?
        WHERE id = ?
        "#,
    )
    .bind(status)
    .bind(Utc::now())
    .bind(counters.dossiers_seen)
    .bind(counters.created)
    .bind(counters.updated)
    .bind(counters.skipped)
    .bind(counters.unrouted)
    .bind(counters.failed)
    .bind(error)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Close runs a previous process left RUNNING
pub async fn close_stale_runs(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE import_runs SET status = 'FAILED', ended_at = ?, error = 'interrupted (process restart)'
         WHERE status = 'RUNNING'",
    )
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn load_run(pool: &SqlitePool, run_id: &str) -> Result<ImportRun> {
    let run = sqlx::query_as::<_, ImportRun>("SELECT * FROM import_runs WHERE id = ?")
        .bind(run_id)
        .fetch_one(pool)
        .await?;
    Ok(run)
}

/// Execute one import run and return its closed run row
///
/// Per-dossier failures are counted and the run continues; a transport or
/// API failure closes the run as FAILED. `last_import_at` is only advanced
/// on success, and to the run's start instant, so dossiers modified while
/// the run was paging are picked up again next time.
pub async fn import_requetes(pool: &SqlitePool, client: &DematSocialClient) -> Result<ImportRun> {
    let page_size = get_setting_i64(pool, "import_page_size", 100).await?.clamp(1, 500);
    let updated_since = get_setting(pool, "last_import_at")
        .await?
        .filter(|v| !v.is_empty());

    let run_id = start_run(pool).await?;
    let run_started = Utc::now();
    info!(
        run_id = %run_id,
        updated_since = updated_since.as_deref().unwrap_or("(full import)"),
        "Import run started"
    );

    let mut counters = RunCounters::default();
    let mut cursor: Option<String> = None;

    loop {
        let page = match client
            .fetch_dossiers(page_size, cursor.as_deref(), updated_since.as_deref())
            .await
        {
            Ok(page) => page,
            Err(e) => {
                error!(run_id = %run_id, "Import aborted: {}", e);
                finish_run(pool, &run_id, "FAILED", &counters, Some(&e.to_string())).await?;
                return load_run(pool, &run_id).await;
            }
        };

        for dossier in &page.nodes {
            counters.dossiers_seen += 1;
            match process_dossier(pool, dossier).await {
                Ok(DossierOutcome::Created { unrouted }) => {
                    counters.created += 1;
                    if unrouted {
                        counters.unrouted += 1;
                    }
                }
                Ok(DossierOutcome::Updated) => counters.updated += 1,
                Ok(DossierOutcome::Skipped) => counters.skipped += 1,
                Err(e) => {
                    counters.failed += 1;
                    error!(dossier = dossier.number, "Dossier import failed: {}", e);
                }
            }
        }

        if !page.page_info.has_next_page {
            break;
        }
        match page.page_info.end_cursor {
            Some(end) => cursor = Some(end),
            // hasNextPage without a cursor would refetch the same page forever
            None => break,
        }
    }

    finish_run(pool, &run_id, "SUCCEEDED", &counters, None).await?;
    set_setting(
        pool,
        "last_import_at",
        &run_started.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
    .await?;

    info!(
        run_id = %run_id,
        seen = counters.dossiers_seen,
        created = counters.created,
        updated = counters.updated,
        skipped = counters.skipped,
        unrouted = counters.unrouted,
        failed = counters.failed,
        "✓ Import run finished"
    );

    load_run(pool, &run_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dematsocial::{Champ, Demandeur, Usager};
    use crate::mapper::{CHAMP_CODE_STRUCTURE, CHAMP_COMMUNE, CHAMP_DESCRIPTION};
    use chrono::Duration as ChronoDuration;
    use sirena_common::db::init_database;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("sirena.db")).await.unwrap();

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO entites (id, nom, label, categorie, code, created_at, updated_at)
             VALUES ('e1', 'ARS Auvergne-Rhône-Alpes', 'ARS-ARA', 'ARS', 'ars-ara', ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        (dir, pool)
    }

    fn dossier(number: i64, code: Option<&str>) -> Dossier {
        let mut champs = vec![
            Champ {
                label: CHAMP_COMMUNE.to_string(),
                string_value: Some("Lyon".to_string()),
            },
            Champ {
                label: CHAMP_DESCRIPTION.to_string(),
                string_value: Some("Premier signalement".to_string()),
            },
        ];
        if let Some(code) = code {
            champs.push(Champ {
                label: CHAMP_CODE_STRUCTURE.to_string(),
                string_value: Some(code.to_string()),
            });
        }

        Dossier {
            number,
            state: "en_construction".to_string(),
            date_depot: Utc::now() - ChronoDuration::days(2),
            date_derniere_modification: Utc::now() - ChronoDuration::days(2),
            usager: Some(Usager {
                email: Some("jeanne.martin@example.fr".to_string()),
            }),
            demandeur: Some(Demandeur {
                civilite: Some("Mme".to_string()),
                nom: Some("Martin".to_string()),
                prenom: Some("Jeanne".to_string()),
            }),
            champs,
        }
    }

    #[tokio::test]
    async fn test_unseen_dossier_creates_routed_requete() {
        let (_dir, pool) = setup().await;

        let outcome = process_dossier(&pool, &dossier(4021, Some("ars-ara"))).await.unwrap();
        assert_eq!(outcome, DossierOutcome::Created { unrouted: false });

        let (numero, dematsocial_id, commune): (i64, Option<i64>, Option<String>) = sqlx::query_as(
            "SELECT numero, dematsocial_id, commune FROM requetes WHERE dematsocial_id = 4021",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(numero, 1);
        assert_eq!(dematsocial_id, Some(4021));
        assert_eq!(commune.as_deref(), Some("Lyon"));

        let (entite_id, statut): (Option<String>, String) = sqlx::query_as(
            "SELECT re.entite_id, re.statut FROM requete_entites re
             JOIN requetes r ON r.id = re.requete_id WHERE r.dematsocial_id = 4021",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(entite_id.as_deref(), Some("e1"));
        assert_eq!(statut, "A_QUALIFIER");
    }

    #[tokio::test]
    async fn test_entity_code_matches_case_insensitively() {
        let (_dir, pool) = setup().await;

        let outcome = process_dossier(&pool, &dossier(1, Some("ARS-ARA"))).await.unwrap();
        assert_eq!(outcome, DossierOutcome::Created { unrouted: false });
    }

    #[tokio::test]
    async fn test_unknown_code_leaves_unrouted() {
        let (_dir, pool) = setup().await;

        let outcome = process_dossier(&pool, &dossier(1, Some("dd-99"))).await.unwrap();
        assert_eq!(outcome, DossierOutcome::Created { unrouted: true });

        let entite_id: Option<String> = sqlx::query_scalar(
            "SELECT entite_id FROM requete_entites re
             JOIN requetes r ON r.id = re.requete_id WHERE r.dematsocial_id = 1",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(entite_id.is_none());
    }

    #[tokio::test]
    async fn test_unchanged_dossier_skipped() {
        let (_dir, pool) = setup().await;
        let d = dossier(1, Some("ars-ara"));

        process_dossier(&pool, &d).await.unwrap();
        let outcome = process_dossier(&pool, &d).await.unwrap();
        assert_eq!(outcome, DossierOutcome::Skipped);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requetes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_modified_dossier_refreshes_fields() {
        let (_dir, pool) = setup().await;

        process_dossier(&pool, &dossier(1, Some("ars-ara"))).await.unwrap();

        let mut modified = dossier(1, Some("ars-ara"));
        modified.champs[0].string_value = Some("Villeurbanne".to_string());
        modified.date_derniere_modification = Utc::now() + ChronoDuration::hours(1);

        let outcome = process_dossier(&pool, &modified).await.unwrap();
        assert_eq!(outcome, DossierOutcome::Updated);

        let commune: Option<String> =
            sqlx::query_scalar("SELECT commune FROM requetes WHERE dematsocial_id = 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(commune.as_deref(), Some("Villeurbanne"));
    }

    #[tokio::test]
    async fn test_worked_requete_never_overwritten() {
        let (_dir, pool) = setup().await;

        process_dossier(&pool, &dossier(1, Some("ars-ara"))).await.unwrap();
        sqlx::query("UPDATE requete_entites SET statut = 'EN_COURS'")
            .execute(&pool)
            .await
            .unwrap();

        let mut modified = dossier(1, Some("ars-ara"));
        modified.champs[0].string_value = Some("Villeurbanne".to_string());
        modified.date_derniere_modification = Utc::now() + ChronoDuration::hours(1);

        let outcome = process_dossier(&pool, &modified).await.unwrap();
        assert_eq!(outcome, DossierOutcome::Skipped);

        let commune: Option<String> =
            sqlx::query_scalar("SELECT commune FROM requetes WHERE dematsocial_id = 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(commune.as_deref(), Some("Lyon"));
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let (_dir, pool) = setup().await;

        let run_id = start_run(&pool).await.unwrap();
        let run = load_run(&pool, &run_id).await.unwrap();
        assert_eq!(run.status, "RUNNING");
        assert!(run.ended_at.is_none());

        let counters = RunCounters {
            dossiers_seen: 10,
            created: 6,
            updated: 1,
            skipped: 2,
            unrouted: 1,
            failed: 1,
        };
        finish_run(&pool, &run_id, "SUCCEEDED", &counters, None).await.unwrap();

        let run = load_run(&pool, &run_id).await.unwrap();
        assert_eq!(run.status, "SUCCEEDED");
        assert!(run.ended_at.is_some());
        assert_eq!(run.dossiers_seen, 10);
        assert_eq!(run.created, 6);
        assert_eq!(run.updated, 1);
        assert_eq!(run.skipped, 2);
        assert_eq!(run.unrouted, 1);
        assert_eq!(run.failed, 1);
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn test_stale_running_rows_closed_as_failed() {
        let (_dir, pool) = setup().await;

        let stale = start_run(&pool).await.unwrap();
        let closed = close_stale_runs(&pool).await.unwrap();
        assert_eq!(closed, 1);

        let run = load_run(&pool, &stale).await.unwrap();
        assert_eq!(run.status, "FAILED");
        assert!(run.ended_at.is_some());
        assert!(run.error.as_deref().unwrap_or("").contains("interrupted"));

        // Nothing left to close
        assert_eq!(close_stale_runs(&pool).await.unwrap(), 0);
    }
}
