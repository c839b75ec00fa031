//! Database schema, models and shared queries

pub mod init;
pub mod migrations;
pub mod models;
pub mod requetes;
pub mod settings;

pub use init::*;
pub use migrations::*;
pub use models::*;
pub use requetes::*;
pub use settings::*;
