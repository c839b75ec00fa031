//! Role model for SIRENA users
//!
//! Roles form a strict ladder: each role grants everything the roles below
//! it grant. `PENDING` is the parking state for accounts created on first
//! login that no administrator has activated yet.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User role, ordered from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Account created on first login, awaiting activation
    Pending,
    /// Read-only access to requêtes in scope
    Reader,
    /// Reader plus requête creation, statut changes and notes
    Writer,
    /// Writer plus user administration and re-routing within the entity subtree
    EntityAdmin,
    /// Full visibility across all entities
    NationalSteering,
    /// National steering plus entity administration
    SuperAdmin,
}

impl Role {
    /// Database string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pending => "PENDING",
            Role::Reader => "READER",
            Role::Writer => "WRITER",
            Role::EntityAdmin => "ENTITY_ADMIN",
            Role::NationalSteering => "NATIONAL_STEERING",
            Role::SuperAdmin => "SUPER_ADMIN",
        }
    }

    /// Parse the database string form
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Role::Pending),
            "READER" => Ok(Role::Reader),
            "WRITER" => Ok(Role::Writer),
            "ENTITY_ADMIN" => Ok(Role::EntityAdmin),
            "NATIONAL_STEERING" => Ok(Role::NationalSteering),
            "SUPER_ADMIN" => Ok(Role::SuperAdmin),
            other => Err(Error::InvalidInput(format!("Unknown role: {}", other))),
        }
    }

    /// True when this role grants at least the privileges of `min`
    pub fn at_least(&self, min: Role) -> bool {
        *self >= min
    }

    /// National roles see every entity; all others are scoped to their
    /// own entity subtree
    pub fn is_national(&self) -> bool {
        matches!(self, Role::NationalSteering | Role::SuperAdmin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Role::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Pending < Role::Reader);
        assert!(Role::Reader < Role::Writer);
        assert!(Role::Writer < Role::EntityAdmin);
        assert!(Role::EntityAdmin < Role::NationalSteering);
        assert!(Role::NationalSteering < Role::SuperAdmin);
    }

    #[test]
    fn test_at_least() {
        assert!(Role::Writer.at_least(Role::Reader));
        assert!(Role::Writer.at_least(Role::Writer));
        assert!(!Role::Reader.at_least(Role::Writer));
        assert!(Role::SuperAdmin.at_least(Role::Pending));
    }

    #[test]
    fn test_round_trip() {
        for role in [
            Role::Pending,
            Role::Reader,
            Role::Writer,
            Role::EntityAdmin,
            Role::NationalSteering,
            Role::SuperAdmin,
        ] {
            assert_eq!(Role::parse(role.as_str()).unwrap(), role);
        }
    }

    #[test]
    fn test_unknown_role_is_error() {
        assert!(Role::parse("ADMIN").is_err());
        assert!(Role::parse("").is_err());
        assert!("reader".parse::<Role>().is_err());
    }

    #[test]
    fn test_is_national() {
        assert!(Role::NationalSteering.is_national());
        assert!(Role::SuperAdmin.is_national());
        assert!(!Role::EntityAdmin.is_national());
        assert!(!Role::Pending.is_national());
    }
}
