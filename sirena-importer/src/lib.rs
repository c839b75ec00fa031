//! # SIRENA Importer
//!
//! Scheduled import of Demat Social dossiers into the SIRENA database.
//!
//! The importer pages through the Demat Social GraphQL API, maps each
//! dossier onto a requête, and routes new requêtes from the structure
//! code declared in the form. It can run once (`run`) or as a resident
//! service (`serve`) with a small status API.

pub mod api;
pub mod dematsocial;
pub mod import;
pub mod mapper;
pub mod scheduler;

pub use dematsocial::DematSocialClient;
pub use scheduler::ImportScheduler;
