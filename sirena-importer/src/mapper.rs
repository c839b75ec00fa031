//! Dossier to requête mapping
//!
//! The démarche form carries free-text champs identified by label. Labels
//! are contractual with the form definition; a missing or renamed champ
//! degrades to a NULL field, never to an import failure.

use crate::dematsocial::Dossier;
use sirena_common::db::models::ReceptionType;
use sirena_common::db::requetes::NewRequete;

/// Champ labels as configured on the démarche
pub const CHAMP_COMMUNE: &str = "Commune de survenue";
pub const CHAMP_DESCRIPTION: &str = "Description des faits";
pub const CHAMP_CODE_STRUCTURE: &str = "Code de la structure";

/// A dossier reduced to requête fields plus its routing hint
#[derive(Debug, Clone)]
pub struct MappedDossier {
    pub requete: NewRequete,
    /// Entity `code` from the routing champ, when the form carried one
    pub entite_code: Option<String>,
}

/// Map a dossier onto requête fields
///
/// `dateDepot` becomes the reception date and the reception type is always
/// FORMULAIRE. The declarant identity comes from the demandeur block, the
/// contact email from the usager account.
pub fn map_dossier(dossier: &Dossier) -> MappedDossier {
    let demandeur = dossier.demandeur.clone().unwrap_or_default();
    let email = dossier.usager.as_ref().and_then(|u| u.email.clone());

    MappedDossier {
        requete: NewRequete {
            dematsocial_id: Some(dossier.number),
            reception_date: dossier.date_depot,
            reception_type: ReceptionType::Formulaire,
            commune: champ_value(dossier, CHAMP_COMMUNE),
            declarant_civilite: clean(demandeur.civilite),
            declarant_prenom: clean(demandeur.prenom),
            declarant_nom: clean(demandeur.nom),
            declarant_email: clean(email),
            declarant_telephone: None,
            description: champ_value(dossier, CHAMP_DESCRIPTION),
        },
        entite_code: champ_value(dossier, CHAMP_CODE_STRUCTURE),
    }
}

/// Value of the first champ with the given label, trimmed, empty → None
fn champ_value(dossier: &Dossier, label: &str) -> Option<String> {
    dossier
        .champs
        .iter()
        .find(|c| c.label == label)
        .and_then(|c| c.string_value.as_deref())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn clean(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
