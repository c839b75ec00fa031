//! Shared requête write path
//!
//! Both the API (manual creation) and the importer (Demat Social dossiers)
//! insert requêtes. The sequential `numero` makes the insert order-sensitive,
//! so allocation and insertion live here and always run inside the caller's
//! transaction.

use crate::db::models::ReceptionType;
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

/// Fields for a new requête, before numero allocation
#[derive(Debug, Clone)]
pub struct NewRequete {
    pub dematsocial_id: Option<i64>,
    pub reception_date: DateTime<Utc>,
    pub reception_type: ReceptionType,
    pub commune: Option<String>,
    pub declarant_civilite: Option<String>,
    pub declarant_prenom: Option<String>,
    pub declarant_nom: Option<String>,
    pub declarant_email: Option<String>,
    pub declarant_telephone: Option<String>,
    pub description: Option<String>,
}

/// Allocate the next sequential requête number
///
/// Must run inside the same transaction as the insert that uses it, or two
/// concurrent creations can collide on the UNIQUE constraint.
pub async fn next_numero(conn: &mut SqliteConnection) -> Result<i64> {
    let numero: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(numero), 0) + 1 FROM requetes")
        .fetch_one(conn)
        .await?;
    Ok(numero)
}

/// Insert a requête and its initial routing row
///
/// `entite_id` of `None` leaves the requête unrouted (visible to national
/// roles only). Returns `(requete_id, numero)`.
pub async fn create_requete(
    conn: &mut SqliteConnection,
    new: &NewRequete,
    entite_id: Option<&str>,
) -> Result<(String, i64)> {
    let numero = next_numero(conn).await?;
    let requete_id = Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO requetes (
            id, numero, dematsocial_id, reception_date, reception_type,
            commune, declarant_civilite, declarant_prenom, declarant_nom,
            declarant_email, declarant_telephone, description,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&requete_id)
    .bind(numero)
    .bind(new.dematsocial_id)
    .bind(new.reception_date)
    .bind(new.reception_type.as_str())
    .bind(&new.commune)
    .bind(&new.declarant_civilite)
    .bind(&new.declarant_prenom)
    .bind(&new.declarant_nom)
    .bind(&new.declarant_email)
    .bind(&new.declarant_telephone)
    .bind(&new.description)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    insert_routing(conn, &requete_id, entite_id).await?;

    Ok((requete_id, numero))
}

/// Insert a routing row for an existing requête
pub async fn insert_routing(
    conn: &mut SqliteConnection,
    requete_id: &str,
    entite_id: Option<&str>,
) -> Result<String> {
    let routing_id = Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO requete_entites (id, requete_id, entite_id, statut, created_at, updated_at)
        VALUES (?, ?, ?, 'A_QUALIFIER', ?, ?)
        "#,
    )
    .bind(&routing_id)
    .bind(requete_id)
    .bind(entite_id)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(routing_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use tempfile::TempDir;

    fn sample_requete() -> NewRequete {
        NewRequete {
            dematsocial_id: None,
            reception_date: Utc::now(),
            reception_type: ReceptionType::Formulaire,
            commune: Some("Lyon".to_string()),
            declarant_civilite: None,
            declarant_prenom: Some("Jeanne".to_string()),
            declarant_nom: Some("Martin".to_string()),
            declarant_email: Some("jeanne.martin@example.fr".to_string()),
            declarant_telephone: None,
            description: Some("Signalement concernant un établissement".to_string()),
        }
    }

    #[tokio::test]
    async fn test_numero_sequence() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("sirena.db")).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        let (_, first) = create_requete(&mut tx, &sample_requete(), None).await.unwrap();
        let (_, second) = create_requete(&mut tx, &sample_requete(), None).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn test_create_requete_writes_routing_row() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("sirena.db")).await.unwrap();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO entites (id, nom, label, categorie, code, created_at, updated_at)
             VALUES ('e1', 'ARS Auvergne', 'ARS-ARA', 'ARS', 'ars-ara', ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        let mut tx = pool.begin().await.unwrap();
        let (requete_id, _) = create_requete(&mut tx, &sample_requete(), Some("e1")).await.unwrap();
        tx.commit().await.unwrap();

        let (entite_id, statut): (Option<String>, String) = sqlx::query_as(
            "SELECT entite_id, statut FROM requete_entites WHERE requete_id = ?",
        )
        .bind(&requete_id)
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(entite_id.as_deref(), Some("e1"));
        assert_eq!(statut, "A_QUALIFIER");
    }

    #[tokio::test]
    async fn test_unrouted_requete_has_null_entite() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("sirena.db")).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        let (requete_id, _) = create_requete(&mut tx, &sample_requete(), None).await.unwrap();
        tx.commit().await.unwrap();

        let entite_id: Option<String> = sqlx::query_scalar(
            "SELECT entite_id FROM requete_entites WHERE requete_id = ?",
        )
        .bind(&requete_id)
        .fetch_one(&pool)
        .await
        .unwrap();

        assert!(entite_id.is_none());
    }
}
