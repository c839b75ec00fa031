//! Database models

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing statut of a requête routing row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statut {
    /// Freshly created or re-routed, awaiting qualification
    AQualifier,
    /// Being processed by the entity
    EnCours,
    /// Processing done, awaiting closure
    Fait,
    /// Closed
    Cloturee,
}

impl Statut {
    pub fn as_str(&self) -> &'static str {
        match self {
            Statut::AQualifier => "A_QUALIFIER",
            Statut::EnCours => "EN_COURS",
            Statut::Fait => "FAIT",
            Statut::Cloturee => "CLOTUREE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "A_QUALIFIER" => Ok(Statut::AQualifier),
            "EN_COURS" => Ok(Statut::EnCours),
            "FAIT" => Ok(Statut::Fait),
            "CLOTUREE" => Ok(Statut::Cloturee),
            other => Err(Error::InvalidInput(format!("Unknown statut: {}", other))),
        }
    }
}

/// Reception channel of a requête
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceptionType {
    Formulaire,
    Email,
    Courrier,
    Telephone,
    Plateforme,
}

impl ReceptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceptionType::Formulaire => "FORMULAIRE",
            ReceptionType::Email => "EMAIL",
            ReceptionType::Courrier => "COURRIER",
            ReceptionType::Telephone => "TELEPHONE",
            ReceptionType::Plateforme => "PLATEFORME",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "FORMULAIRE" => Ok(ReceptionType::Formulaire),
            "EMAIL" => Ok(ReceptionType::Email),
            "COURRIER" => Ok(ReceptionType::Courrier),
            "TELEPHONE" => Ok(ReceptionType::Telephone),
            "PLATEFORME" => Ok(ReceptionType::Plateforme),
            other => Err(Error::InvalidInput(format!(
                "Unknown reception type: {}",
                other
            ))),
        }
    }
}

/// Administrative entity (ARS, départementale direction, conseil...)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Entite {
    pub id: String,
    pub nom: String,
    pub label: String,
    pub categorie: String,
    /// Routing code used by the Demat Social import to attach dossiers
    pub code: Option<String>,
    pub email: Option<String>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    /// OIDC subject, set on first login
    pub sub: Option<String>,
    pub email: String,
    pub prenom: Option<String>,
    pub nom: Option<String>,
    pub role: String,
    pub entite_id: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    /// Raw id_token kept for the provider logout hint
    pub id_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Requete {
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
}

/// Routing of a requête to one entity, carrying the processing statut.
/// `entite_id` is NULL for imported dossiers whose routing code matched
/// no entity ("unrouted").
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RequeteEntite {
    pub id: String,
    pub requete_id: String,
    pub entite_id: Option<String>,
    pub statut: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RequeteNote {
    pub id: String,
    pub requete_entite_id: String,
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UploadedFile {
    pub id: String,
    pub note_id: Option<String>,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    /// File name inside the uploads directory (a UUID, no extension)
    pub path: String,
    pub sha256: String,
    pub scan_status: String,
    pub uploaded_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ImportRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
    pub dossiers_seen: i64,
    pub created: i64,
    pub updated: i64,
    pub skipped: i64,
    pub unrouted: i64,
    pub failed: i64,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statut_round_trip() {
        for statut in [
            Statut::AQualifier,
            Statut::EnCours,
            Statut::Fait,
            Statut::Cloturee,
        ] {
            assert_eq!(Statut::parse(statut.as_str()).unwrap(), statut);
        }
        assert!(Statut::parse("OUVERTE").is_err());
    }

    #[test]
    fn test_reception_type_round_trip() {
        for rt in [
            ReceptionType::Formulaire,
            ReceptionType::Email,
            ReceptionType::Courrier,
            ReceptionType::Telephone,
            ReceptionType::Plateforme,
        ] {
            assert_eq!(ReceptionType::parse(rt.as_str()).unwrap(), rt);
        }
        assert!(ReceptionType::parse("FAX").is_err());
    }
}
