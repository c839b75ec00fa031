//! # SIRENA Common Library
//!
//! Shared code for the SIRENA services including:
//! - Database schema, initialization and queries
//! - Shared models (requêtes, entités, users, sessions)
//! - Role model and statut enums
//! - Configuration loading and root folder resolution
//! - Pagination helpers

pub mod config;
pub mod db;
pub mod error;
pub mod pagination;
pub mod roles;

pub use error::{Error, Result};
pub use roles::Role;
